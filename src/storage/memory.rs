use super::{Engine, Status};
use crate::error::Result;

/// An in-memory key/value storage engine using the Rust standard library
/// B-tree implementation. Data is not persisted.
#[derive(Default)]
pub struct Memory {
    data: std::collections::BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Memory {
    /// Creates a new Memory key/value storage engine.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Engine for Memory {
    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn scan(
        &mut self,
        range: (std::ops::Bound<Vec<u8>>, std::ops::Bound<Vec<u8>>),
    ) -> Box<dyn super::ScanIterator + '_> {
        Box::new(self.data.range(range).map(|(k, v)| Ok((k.clone(), v.clone()))))
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_vec(), value);
        Ok(())
    }

    fn status(&mut self) -> Result<Status> {
        Ok(Status {
            name: "memory".to_string(),
            keys: self.data.len() as u64,
            size: self.data.iter().fold(0, |size, (k, v)| size + k.len() as u64 + v.len() as u64),
            disk_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ops() -> Result<()> {
        let mut s = Memory::new();

        assert_eq!(s.get(b"a")?, None);
        s.set(b"a", vec![1])?;
        assert_eq!(s.get(b"a")?, Some(vec![1]));

        s.set(b"b", vec![2])?;
        assert_eq!(s.get(b"b")?, Some(vec![2]));
        assert_eq!(s.get(b"a")?, Some(vec![1]));

        s.set(b"a", vec![3])?;
        assert_eq!(s.get(b"a")?, Some(vec![3]));

        s.delete(b"a")?;
        assert_eq!(s.get(b"a")?, None);
        s.delete(b"c")?;
        Ok(())
    }

    #[test]
    fn scan_range() -> Result<()> {
        use std::ops::Bound;
        let mut s = Memory::new();
        for key in [b"a", b"b", b"c"] {
            s.set(key, key.to_vec())?;
        }
        let items = s
            .scan((Bound::Included(b"a".to_vec()), Bound::Excluded(b"c".to_vec())))
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(items, vec![(b"a".to_vec(), b"a".to_vec()), (b"b".to_vec(), b"b".to_vec())]);
        Ok(())
    }
}
