use super::command::{Command, DecodedCommand, Noop};
use crate::core::{QueueError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{Level, event};

/// Turns a stored command payload back into a typed command.
pub type CommandDecoder = Arc<dyn Fn(&serde_json::Value) -> Result<DecodedCommand> + Send + Sync>;

/// Maps symbolic command names to their decoders.
///
/// Built once at startup from the closed set of command types the process
/// knows about. The consumer works from a snapshot taken when it starts, so
/// registrations made afterwards are not visible to a running loop.
#[derive(Clone)]
pub struct TypeRegistry {
    decoders: HashMap<String, CommandDecoder>,
}

impl TypeRegistry {
    /// Registry holding only the built-in [`Noop`] command.
    pub fn new() -> Self {
        let mut registry = Self {
            decoders: HashMap::new(),
        };
        registry.register_command::<Noop>();
        registry
    }

    /// Adds a decoder for `name`. An already registered name is left alone
    /// and `false` is returned.
    pub fn register(&mut self, name: impl Into<String>, decoder: CommandDecoder) -> bool {
        let name = name.into();
        if self.decoders.contains_key(&name) {
            event!(Level::DEBUG, command = %name, "command type already registered");
            return false;
        }
        self.decoders.insert(name, decoder);
        true
    }

    /// Registers `T` under `T::NAME` with a JSON decoder.
    pub fn register_command<T: Command>(&mut self) -> bool {
        self.register(T::NAME, Arc::new(decode_json::<T>))
    }

    pub fn with_command<T: Command>(mut self) -> Self {
        self.register_command::<T>();
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.decoders.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn decode(&self, name: &str, payload: &serde_json::Value) -> Result<DecodedCommand> {
        let decoder = self
            .decoders
            .get(name)
            .ok_or_else(|| QueueError::UnknownCommandType(name.to_string()))?;
        decoder(payload)
    }

    /// Serializes a command known to this registry into its name and payload.
    pub fn encode<T: Command>(&self, command: &T) -> Result<(&'static str, serde_json::Value)> {
        if !self.contains(T::NAME) {
            return Err(QueueError::UnknownCommandType(T::NAME.to_string()));
        }
        Ok((T::NAME, serde_json::to_value(command)?))
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_json<T: Command>(payload: &serde_json::Value) -> Result<DecodedCommand> {
    // An absent payload binds to the command's empty form.
    let parsed = if payload.is_null() {
        serde_json::from_value::<T>(serde_json::Value::Object(Default::default()))
    } else {
        serde_json::from_value::<T>(payload.clone())
    };
    parsed
        .map(DecodedCommand::new)
        .map_err(|e| QueueError::Decode(format!("{}: {}", T::NAME, e)))
}
