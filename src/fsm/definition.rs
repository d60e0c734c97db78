//! Declarative FSM definitions and their compilation into runnable machines

use super::machine::Machine;
use super::registry::{Action, Guard, Handler, HandlerRegistry};
use crate::context::ConversationContext;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

/// One state of a machine. `events` name the actions run on entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub initial: bool,
}

#[cfg(test)]
impl State {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
            initial: false,
        }
    }

    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }
}

/// Edge between two states. Taken when every `conditions` guard holds and no
/// `unless` guard does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub source: String,
    pub dest: String,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub unless: Vec<String>,
}

#[cfg(test)]
impl Transition {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            conditions: Vec::new(),
            unless: Vec::new(),
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.conditions.push(condition.into());
        self
    }

    pub fn unless(mut self, condition: impl Into<String>) -> Self {
        self.unless.push(condition.into());
        self
    }
}

/// Malformed definition. Fatal for the conversation that asked for the
/// machine; never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("FSM '{0}' has no initial state")]
    NoInitialState(String),
    #[error("FSM '{fsm}' has more than one initial state: {states:?}")]
    MultipleInitialStates { fsm: String, states: Vec<String> },
    #[error("FSM '{fsm}' declares state '{state}' more than once")]
    DuplicateState { fsm: String, state: String },
    #[error("FSM '{fsm}': transition {from} -> {dest} references unknown state '{state}'")]
    DanglingTransition {
        fsm: String,
        from: String,
        dest: String,
        state: String,
    },
    #[error("FSM '{fsm}' lists '{name}' in funcs but no such handler is registered")]
    UnknownFunction { fsm: String, name: String },
    #[error("FSM '{fsm}' references '{name}' which is not bound")]
    UnboundFunction { fsm: String, name: String },
    #[error("FSM '{fsm}' uses '{name}' as {expected} but it is registered as {actual}")]
    WrongHandlerKind {
        fsm: String,
        name: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("FSM '{fsm}' has no state named '{state}'")]
    UnknownState { fsm: String, state: String },
    #[error("FSM definition not found: {0}")]
    NotFound(String),
}

/// Stored, immutable-per-version machine specification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsmDefinition {
    /// Store-assigned key; `None` until persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub states: Vec<State>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    /// Registry handlers this definition binds
    #[serde(default)]
    pub funcs: Vec<String>,
}

impl FsmDefinition {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, states: Vec<State>, transitions: Vec<Transition>) -> Self {
        Self {
            id: None,
            name: name.into(),
            states,
            transitions,
            funcs: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn with_funcs<I, S>(mut self, funcs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.funcs = funcs.into_iter().map(Into::into).collect();
        self
    }

    /// Build a machine for `ctx`, resuming at `current_state` when given and
    /// at the initial state otherwise. The resumed state is looked up by name
    /// so a checkpoint always resolves against this definition's own states.
    pub fn build_machine(
        &self,
        ctx: ConversationContext,
        registry: &HandlerRegistry,
        current_state: Option<&State>,
    ) -> Result<Machine, DefinitionError> {
        let compiled = Arc::new(self.compile(registry)?);
        let state = match current_state {
            Some(state) => compiled
                .state(&state.name)
                .cloned()
                .ok_or_else(|| DefinitionError::UnknownState {
                    fsm: self.name.clone(),
                    state: state.name.clone(),
                })?,
            None => compiled.initial_state().clone(),
        };
        Ok(Machine::new(compiled, ctx, state))
    }

    /// Validate the definition and resolve every referenced name
    pub fn compile(&self, registry: &HandlerRegistry) -> Result<CompiledFsm, DefinitionError> {
        let mut seen = HashSet::new();
        for state in &self.states {
            if !seen.insert(state.name.as_str()) {
                return Err(DefinitionError::DuplicateState {
                    fsm: self.name.clone(),
                    state: state.name.clone(),
                });
            }
        }

        let initial: Vec<usize> = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.initial)
            .map(|(i, _)| i)
            .collect();
        let initial = match initial.as_slice() {
            [] => return Err(DefinitionError::NoInitialState(self.name.clone())),
            [index] => *index,
            many => {
                return Err(DefinitionError::MultipleInitialStates {
                    fsm: self.name.clone(),
                    states: many.iter().map(|&i| self.states[i].name.clone()).collect(),
                })
            }
        };

        for t in &self.transitions {
            for endpoint in [&t.source, &t.dest] {
                if !seen.contains(endpoint.as_str()) {
                    return Err(DefinitionError::DanglingTransition {
                        fsm: self.name.clone(),
                        from: t.source.clone(),
                        dest: t.dest.clone(),
                        state: endpoint.clone(),
                    });
                }
            }
        }

        let mut bindings = HashMap::new();
        for name in &self.funcs {
            let handler = registry
                .get(name)
                .ok_or_else(|| DefinitionError::UnknownFunction {
                    fsm: self.name.clone(),
                    name: name.clone(),
                })?;
            bindings.insert(name.clone(), handler.clone());
        }

        let compiled = CompiledFsm {
            name: self.name.clone(),
            states: self.states.clone(),
            transitions: self.transitions.clone(),
            initial,
            bindings,
        };

        for state in &compiled.states {
            for event in &state.events {
                compiled.action(event)?;
            }
        }
        for t in &compiled.transitions {
            for condition in t.conditions.iter().chain(&t.unless) {
                compiled.guard(condition)?;
            }
        }

        Ok(compiled)
    }
}

/// A validated definition with every name bound to its handler
#[derive(Debug)]
pub struct CompiledFsm {
    name: String,
    states: Vec<State>,
    transitions: Vec<Transition>,
    initial: usize,
    bindings: HashMap<String, Handler>,
}

impl CompiledFsm {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn initial_state(&self) -> &State {
        &self.states[self.initial]
    }

    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.iter().find(|s| s.name == name)
    }

    /// Outgoing transitions of `source`, in declared order
    pub fn outgoing<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.source == source)
    }

    pub fn guard(&self, name: &str) -> Result<Arc<dyn Guard>, DefinitionError> {
        match self.bindings.get(name) {
            Some(Handler::Guard(guard)) => Ok(Arc::clone(guard)),
            Some(other) => Err(DefinitionError::WrongHandlerKind {
                fsm: self.name.clone(),
                name: name.to_string(),
                expected: "guard",
                actual: other.kind(),
            }),
            None => Err(self.unbound(name)),
        }
    }

    pub fn action(&self, name: &str) -> Result<Arc<dyn Action>, DefinitionError> {
        match self.bindings.get(name) {
            Some(Handler::Action(action)) => Ok(Arc::clone(action)),
            Some(other) => Err(DefinitionError::WrongHandlerKind {
                fsm: self.name.clone(),
                name: name.to_string(),
                expected: "action",
                actual: other.kind(),
            }),
            None => Err(self.unbound(name)),
        }
    }

    fn unbound(&self, name: &str) -> DefinitionError {
        DefinitionError::UnboundFunction {
            fsm: self.name.clone(),
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::builtins::register_builtins;
    use serde_json::json;

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        register_builtins(&mut registry);
        registry
    }

    fn bye_fsm() -> FsmDefinition {
        FsmDefinition::new(
            "bye",
            vec![
                State::new("start").initial().with_events(["greet"]),
                State::new("end"),
            ],
            vec![Transition::new("start", "end").when("user_said_bye")],
        )
        .with_funcs(["greet", "user_said_bye"])
    }

    #[test]
    fn test_compile_valid_definition() {
        let compiled = bye_fsm().compile(&registry()).unwrap();
        assert_eq!(compiled.initial_state().name, "start");
        assert_eq!(compiled.outgoing("start").count(), 1);
        assert_eq!(compiled.outgoing("end").count(), 0);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let def: FsmDefinition = serde_json::from_value(json!({
            "name": "bye",
            "states": [
                { "name": "start", "initial": true, "events": ["greet"] },
                { "name": "end" }
            ],
            "transitions": [
                { "source": "start", "dest": "end", "conditions": ["user_said_bye"] }
            ],
            "funcs": ["greet", "user_said_bye"]
        }))
        .unwrap();
        assert_eq!(def, bye_fsm());
    }

    #[test]
    fn test_no_initial_state() {
        let mut def = bye_fsm();
        def.states[0].initial = false;
        assert_eq!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::NoInitialState("bye".to_string())
        );
    }

    #[test]
    fn test_multiple_initial_states() {
        let mut def = bye_fsm();
        def.states[1].initial = true;
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::MultipleInitialStates { states, .. } if states == ["start", "end"]
        ));
    }

    #[test]
    fn test_duplicate_state() {
        let mut def = bye_fsm();
        def.states.push(State::new("end"));
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::DuplicateState { state, .. } if state == "end"
        ));
    }

    #[test]
    fn test_dangling_transition() {
        let mut def = bye_fsm();
        def.transitions.push(Transition::new("end", "nowhere"));
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::DanglingTransition { state, .. } if state == "nowhere"
        ));
    }

    #[test]
    fn test_unbound_event() {
        let def = bye_fsm().with_funcs(["user_said_bye"]);
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::UnboundFunction { name, .. } if name == "greet"
        ));
    }

    #[test]
    fn test_unknown_func() {
        let def = bye_fsm().with_funcs(["greet", "user_said_bye", "launch_rockets"]);
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::UnknownFunction { name, .. } if name == "launch_rockets"
        ));
    }

    #[test]
    fn test_guard_used_as_event() {
        let mut def = bye_fsm();
        def.states[0].events = vec!["user_said_bye".to_string()];
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::WrongHandlerKind { expected: "action", actual: "guard", .. }
        ));
    }

    #[test]
    fn test_action_used_as_condition() {
        let mut def = bye_fsm();
        def.transitions[0].unless = vec!["greet".to_string()];
        assert!(matches!(
            def.compile(&registry()).unwrap_err(),
            DefinitionError::WrongHandlerKind { expected: "guard", actual: "action", .. }
        ));
    }
}
