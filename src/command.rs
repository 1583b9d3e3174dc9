use crate::model::{Timestamp, ValueType};
use serde::{Deserialize, Serialize};

/// A single state-machine mutation. These are the only operations the
/// applier understands; consensus treats their encoding as opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    SetConfig {
        namespace: String,
        key: String,
        value: Vec<u8>,
        value_type: ValueType,
        author: String,
        timestamp: Timestamp,
    },
    DeleteConfig {
        namespace: String,
        key: String,
        author: String,
        timestamp: Timestamp,
    },
    SetNamespace {
        path: String,
        description: String,
        owner: String,
        author: String,
        timestamp: Timestamp,
    },
    DeleteNamespace {
        path: String,
        author: String,
        timestamp: Timestamp,
    },
    SetConfigBlobRef {
        namespace: String,
        key: String,
        blob_id: String,
        value_type: ValueType,
        author: String,
        timestamp: Timestamp,
    },
}

impl Mutation {
    /// Rough wire footprint, used by the proposer's byte threshold.
    pub fn approximate_size(&self) -> u64 {
        let strings = match self {
            Mutation::SetConfig {
                namespace,
                key,
                value,
                author,
                ..
            } => namespace.len() + key.len() + value.len() + author.len(),
            Mutation::DeleteConfig {
                namespace,
                key,
                author,
                ..
            } => namespace.len() + key.len() + author.len(),
            Mutation::SetNamespace {
                path,
                description,
                owner,
                author,
                ..
            } => path.len() + description.len() + owner.len() + author.len(),
            Mutation::DeleteNamespace { path, author, .. } => path.len() + author.len(),
            Mutation::SetConfigBlobRef {
                namespace,
                key,
                blob_id,
                author,
                ..
            } => namespace.len() + key.len() + blob_id.len() + author.len(),
        };
        strings as u64 + 64
    }

    pub fn author(&self) -> &str {
        match self {
            Mutation::SetConfig { author, .. }
            | Mutation::DeleteConfig { author, .. }
            | Mutation::SetNamespace { author, .. }
            | Mutation::DeleteNamespace { author, .. }
            | Mutation::SetConfigBlobRef { author, .. } => author,
        }
    }
}

/// The unit of consensus. `Batch` carries plain mutations only, so batches
/// cannot nest by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Single(Mutation),
    Batch(Vec<Mutation>),
}

impl Command {
    /// Wrap a drained batch, unwrapping the singleton case.
    pub fn from_batch(mut mutations: Vec<Mutation>) -> Command {
        if mutations.len() == 1 {
            Command::Single(mutations.remove(0))
        } else {
            Command::Batch(mutations)
        }
    }

    /// The mutations in apply order. A batch applies sequentially; every
    /// replica observes the same order because it is part of the encoding.
    pub fn mutations(&self) -> &[Mutation] {
        match self {
            Command::Single(m) => std::slice::from_ref(m),
            Command::Batch(ms) => ms,
        }
    }

    /// Number of state-machine commands this entry carries. Snapshot
    /// accounting counts a batch of N as N, not 1.
    pub fn command_count(&self) -> u64 {
        match self {
            Command::Single(_) => 1,
            Command::Batch(ms) => ms.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn set(key: &str) -> Mutation {
        Mutation::SetConfig {
            namespace: "prod".into(),
            key: key.into(),
            value: b"5s".to_vec(),
            value_type: ValueType::String,
            author: "tester".into(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn singleton_batches_are_unwrapped() {
        let command = Command::from_batch(vec![set("timeout")]);
        assert!(matches!(command, Command::Single(_)));
        assert_eq!(command.command_count(), 1);
    }

    #[test]
    fn batch_preserves_order_and_count() {
        let command = Command::from_batch(vec![set("a"), set("b"), set("c")]);
        assert_eq!(command.command_count(), 3);
        let keys: Vec<_> = command
            .mutations()
            .iter()
            .map(|m| match m {
                Mutation::SetConfig { key, .. } => key.clone(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }
}
