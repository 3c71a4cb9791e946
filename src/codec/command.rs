use crate::storage::SEED_RECORD_NAME;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// A command that can be queued for background execution.
///
/// `NAME` is the symbolic type tag stored with every job; it must be unique
/// among the commands registered in one [`TypeRegistry`](super::TypeRegistry).
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;
}

/// Command that does nothing. Also the type of every collection's seed record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Noop {}

impl Command for Noop {
    const NAME: &'static str = SEED_RECORD_NAME;
}

/// A decoded command whose concrete type is only known at runtime.
pub struct DecodedCommand {
    name: String,
    value: Box<dyn Any + Send + Sync>,
}

impl DecodedCommand {
    pub fn new<T: Command>(command: T) -> Self {
        Self {
            name: T::NAME.to_string(),
            value: Box::new(command),
        }
    }

    /// Wraps a value decoded by a custom decoder under an explicit name.
    pub fn from_parts(name: impl Into<String>, value: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Takes the typed command out, or gives `self` back if the type does not match.
    pub fn downcast<T: Any>(self) -> std::result::Result<T, Self> {
        let Self { name, value } = self;
        match value.downcast::<T>() {
            Ok(command) => Ok(*command),
            Err(value) => Err(Self { name, value }),
        }
    }
}

impl fmt::Debug for DecodedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedCommand")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
