use super::ChainTable;

use serde::de::{Deserialize, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde::Deserializer;

use std::fmt;
use std::marker::PhantomData;

struct ChainTableVisitor<T: 'static> {
    marker: PhantomData<fn() -> ChainTable<T>>,
}

impl<T> ChainTableVisitor<T> {
    fn new() -> Self {
        ChainTableVisitor {
            marker: PhantomData,
        }
    }
}

impl<'de, T> Visitor<'de> for ChainTableVisitor<T>
where
    T: Deserialize<'de>,
{
    type Value = ChainTable<T>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a sequence of hash and value pairs")
    }

    fn visit_seq<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let table = ChainTable::new();

        while let Some((hash, value)) = access.next_element::<(u64, T)>()? {
            // Serialized entries are distinct; no duplicate check is needed.
            table.insert(hash, |_| false, value);
        }

        Ok(table)
    }
}

/// Deserializes into a table with the default sizing and no tombstone predicate.
impl<'de, T> Deserialize<'de> for ChainTable<T>
where
    T: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_seq(ChainTableVisitor::<T>::new())
    }
}

/// Serializes every live entry as a `(hash, value)` pair while holding the resize lock.
impl<T> Serialize for ChainTable<T>
where
    T: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        let mut error = None;
        self.scan_pairs(|hash, value| {
            if error.is_none() {
                if let Err(e) = seq.serialize_element(&(hash, value)) {
                    error.replace(e);
                    return false;
                }
            }
            true
        });

        if let Some(e) = error {
            return Err(e);
        }

        seq.end()
    }
}
