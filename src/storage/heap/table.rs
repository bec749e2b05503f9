use std::path::PathBuf;

use anyhow::Result;

use crate::common::{RecordOffset, NO_FREE_SLOT};
use crate::error::StorageError;
use crate::storage::file_manager::DataFile;
use crate::storage::utils::{Deserializer, Serializer};

const SLOT_LIVE: u8 = 1;
const SLOT_FREE: u8 = 0;
const FREE_POINTER_SIZE: usize = std::mem::size_of::<RecordOffset>();

pub struct HeapTupleIterator<'a> {
    curr_offset: RecordOffset,
    heap: &'a HeapFile,
}

impl<'a> HeapTupleIterator<'a> {
    fn new(heap: &'a HeapFile) -> Self {
        Self {
            curr_offset: 0,
            heap,
        }
    }

    fn fetch_next_record(&mut self) -> Result<Option<(RecordOffset, Vec<u8>)>> {
        loop {
            if self.curr_offset >= self.heap.file.filesize() {
                return Ok(None);
            }
            let offset = self.curr_offset;
            self.curr_offset += self.heap.slot_width as u64;
            if let Some(payload) = self.heap.read_record(offset)? {
                return Ok(Some((offset, payload)));
            }
        }
    }
}

impl<'a> std::iter::Iterator for HeapTupleIterator<'a> {
    type Item = Result<(RecordOffset, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetch_next_record().transpose()
    }
}

/// The record file of a table: a sequence of fixed-width slots.
///
/// Every slot starts with a tombstone byte. A free slot stores the offset of
/// the next free slot in the first bytes of its payload, so the free slots
/// form an intrusive list whose head is kept in the table metadata.
pub struct HeapFile {
    file: DataFile,
    payload_width: usize,
    slot_width: usize,
}

impl HeapFile {
    pub fn create(path: impl Into<PathBuf>, payload_width: usize) -> Result<Self> {
        let file = DataFile::create(path)?;
        Ok(Self::with_file(file, payload_width))
    }

    pub fn open(path: impl Into<PathBuf>, payload_width: usize) -> Result<Self> {
        let file = DataFile::open(path)?;
        let heap = Self::with_file(file, payload_width);
        if heap.file.filesize() % heap.slot_width as u64 != 0 {
            return Err(StorageError::corruption(format!(
                "Boundary check for {} failed. {} is not divisible by slot width {}",
                heap.file.path().display(),
                heap.file.filesize(),
                heap.slot_width
            )));
        }
        Ok(heap)
    }

    fn with_file(file: DataFile, payload_width: usize) -> Self {
        let slot_width = payload_width.max(FREE_POINTER_SIZE) + 1;
        Self {
            file,
            payload_width,
            slot_width,
        }
    }

    pub fn slot_width(&self) -> usize {
        self.slot_width
    }

    pub fn slot_count(&self) -> u64 {
        self.file.filesize() / self.slot_width as u64
    }

    fn check_offset(&self, offset: RecordOffset) -> Result<()> {
        if offset % self.slot_width as u64 != 0 || offset >= self.file.filesize() {
            Err(StorageError::not_found(format!("record at offset {offset}")))
        } else {
            Ok(())
        }
    }

    fn read_slot(&self, offset: RecordOffset) -> Result<Vec<u8>> {
        self.check_offset(offset)?;
        let mut slot = vec![0u8; self.slot_width];
        self.file.read_at(offset, &mut slot)?;
        Ok(slot)
    }

    /// Returns the payload of a live record, None if the slot is free.
    pub fn read_record(&self, offset: RecordOffset) -> Result<Option<Vec<u8>>> {
        let mut slot = self.read_slot(offset)?;
        match slot[0] {
            SLOT_LIVE => {
                slot.remove(0);
                slot.truncate(self.payload_width);
                Ok(Some(slot))
            }
            SLOT_FREE => Ok(None),
            flag => Err(StorageError::corruption(format!(
                "slot {offset} has an invalid tombstone byte {flag}"
            ))),
        }
    }

    /// Writes a new record into the head of the free list, or appends one when
    /// the list is empty. Returns the record offset.
    pub fn insert_record(
        &mut self,
        payload: &[u8],
        free_list_head: &mut RecordOffset,
    ) -> Result<RecordOffset> {
        let slot = self.live_slot(payload);
        if *free_list_head == NO_FREE_SLOT {
            return self.file.append(&slot);
        }

        let offset = *free_list_head;
        let free_slot = self.read_slot(offset)?;
        if free_slot[0] != SLOT_FREE {
            return Err(StorageError::corruption(format!(
                "free list head {offset} points at a live record"
            )));
        }
        let next_free = Deserializer::new(&free_slot[1..]).deserialize_u64();
        self.file.write_at(offset, &slot)?;
        *free_list_head = next_free;
        Ok(offset)
    }

    /// Overwrites the payload of a live record.
    pub fn update_record(&mut self, offset: RecordOffset, payload: &[u8]) -> Result<()> {
        if self.read_record(offset)?.is_none() {
            return Err(StorageError::not_found(format!("record at offset {offset}")));
        }
        let slot = self.live_slot(payload);
        self.file.write_at(offset, &slot)
    }

    /// Marks a live record as deleted and pushes its slot onto the free list.
    pub fn free_record(
        &mut self,
        offset: RecordOffset,
        free_list_head: &mut RecordOffset,
    ) -> Result<()> {
        if self.read_record(offset)?.is_none() {
            return Err(StorageError::not_found(format!("record at offset {offset}")));
        }
        let mut slot = vec![0u8; self.slot_width];
        let mut serializer = Serializer::new(&mut slot);
        serializer.serialize_u8(SLOT_FREE);
        serializer.serialize_u64(*free_list_head);
        self.file.write_at(offset, &slot)?;
        *free_list_head = offset;
        Ok(())
    }

    fn live_slot(&self, payload: &[u8]) -> Vec<u8> {
        let mut slot = vec![0u8; self.slot_width];
        slot[0] = SLOT_LIVE;
        slot[1..1 + payload.len()].copy_from_slice(payload);
        slot
    }

    pub fn iter(&self) -> HeapTupleIterator<'_> {
        HeapTupleIterator::new(self)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use rand::Rng;
    use tempfile::tempdir;

    use super::HeapFile;
    use crate::common::NO_FREE_SLOT;
    use crate::error::StorageError;

    #[test]
    fn basic_test() -> Result<()> {
        let data_dir = tempdir()?;
        let path = data_dir.path().join("items.tbl");
        let mut heap = HeapFile::create(&path, 12)?;
        let mut free_list_head = NO_FREE_SLOT;

        let records = (0..10u8).map(|i| [i; 12]).collect::<Vec<_>>();
        let mut offsets = Vec::new();
        for record in &records {
            offsets.push(heap.insert_record(record, &mut free_list_head)?);
        }
        assert_eq!(offsets[1], heap.slot_width() as u64);

        let collected = heap.iter().collect::<Result<Vec<_>>>()?;
        assert_eq!(collected.len(), records.len());
        for ((offset, payload), record) in collected.iter().zip(&records) {
            assert_eq!(payload.as_slice(), record.as_slice());
            assert!(offsets.contains(offset));
        }
        Ok(())
    }

    #[test]
    fn reuses_freed_slots_last_in_first_out() -> Result<()> {
        let data_dir = tempdir()?;
        let mut heap = HeapFile::create(data_dir.path().join("t.tbl"), 2)?;
        assert_eq!(heap.slot_width(), 9);
        let mut head = NO_FREE_SLOT;

        let a = heap.insert_record(&[1, 1], &mut head)?;
        let b = heap.insert_record(&[2, 2], &mut head)?;
        let c = heap.insert_record(&[3, 3], &mut head)?;
        heap.free_record(a, &mut head)?;
        heap.free_record(c, &mut head)?;
        assert_eq!(head, c);
        assert!(heap.read_record(a)?.is_none());

        assert_eq!(heap.insert_record(&[4, 4], &mut head)?, c);
        assert_eq!(heap.insert_record(&[5, 5], &mut head)?, a);
        assert_eq!(head, NO_FREE_SLOT);
        assert_eq!(heap.insert_record(&[6, 6], &mut head)?, 3 * 9);
        assert_eq!(heap.read_record(b)?, Some(vec![2, 2]));
        assert_eq!(heap.slot_count(), 4);
        Ok(())
    }

    #[test]
    fn random_insert_free_keeps_slots_consistent() -> Result<()> {
        let data_dir = tempdir()?;
        let mut heap = HeapFile::create(data_dir.path().join("r.tbl"), 4)?;
        let mut head = NO_FREE_SLOT;
        let mut live = Vec::new();
        let mut rng = rand::thread_rng();
        for i in 0..200u32 {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let (offset, _) = live.swap_remove(rng.gen_range(0..live.len()));
                heap.free_record(offset, &mut head)?;
            } else {
                let payload = i.to_be_bytes();
                live.push((heap.insert_record(&payload, &mut head)?, payload));
            }
        }
        let stored = heap.iter().collect::<Result<Vec<_>>>()?;
        assert_eq!(stored.len(), live.len());
        for (offset, payload) in &live {
            assert_eq!(heap.read_record(*offset)?, Some(payload.to_vec()));
        }
        Ok(())
    }

    #[test]
    fn out_of_range_offsets_are_not_found() -> Result<()> {
        let data_dir = tempdir()?;
        let mut heap = HeapFile::create(data_dir.path().join("n.tbl"), 8)?;
        let mut head = NO_FREE_SLOT;
        heap.insert_record(&[0; 8], &mut head)?;
        for offset in [3, 9 * 5] {
            let err = heap.read_record(offset).unwrap_err();
            assert!(matches!(
                StorageError::kind_of(&err),
                Some(StorageError::NotFound(_))
            ));
        }
        Ok(())
    }
}
