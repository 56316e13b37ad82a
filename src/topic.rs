use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Maximum length for topic names
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Topic for grouping connections interested in the same category of messages
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic {
    name: String,
}

impl Topic {
    /// Create a new topic
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidTopic("Topic name cannot be empty".into()));
        }
        if name.len() > MAX_TOPIC_LENGTH {
            return Err(Error::TopicTooLong);
        }
        if name.chars().any(char::is_control) {
            return Err(Error::InvalidTopic(format!(
                "Topic name contains control characters: {:?}",
                name
            )));
        }
        Ok(Self {
            name: name.to_string(),
        })
    }

    /// Get the topic name
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}
