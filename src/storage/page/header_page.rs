use crate::common::{PageId, PAGE_SIZE};

/// Header page layout (page 0 of every database file):
///
/// | Field        | Offset | Size |
/// |--------------|--------|------|
/// | record_count | 0      | 4    |
/// | records      | 4      | 36*n |
///
/// Each record maps a fixed 32-byte name (NUL padded) to a root page id.
/// B+trees persist their root pointer here under the index name.
const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

pub struct HeaderPage<'a> {
    data: &'a mut [u8],
}

impl<'a> HeaderPage<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn init(&mut self) {
        self.data.fill(0);
    }

    pub fn record_count(&self) -> usize {
        view(self.data).record_count()
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        view(self.data).get_root_id(name)
    }

    /// Adds a record. Returns false when the page is full, the name exceeds
    /// 32 bytes, or a record with the same name exists.
    pub fn insert_record(&mut self, name: &str, root_id: PageId) -> bool {
        if name.len() > NAME_SIZE || self.find_record(name).is_some() {
            return false;
        }
        let count = self.record_count();
        if count >= MAX_RECORDS {
            return false;
        }

        let offset = RECORDS_OFFSET + count * RECORD_SIZE;
        self.data[offset..offset + NAME_SIZE].fill(0);
        self.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        self.data[offset + NAME_SIZE..offset + RECORD_SIZE]
            .copy_from_slice(&root_id.as_u32().to_le_bytes());
        self.set_record_count(count + 1);
        true
    }

    /// Rewrites the root id of an existing record. Returns false if absent.
    pub fn update_record(&mut self, name: &str, root_id: PageId) -> bool {
        match self.find_record(name) {
            Some(index) => {
                let offset = RECORDS_OFFSET + index * RECORD_SIZE + NAME_SIZE;
                self.data[offset..offset + 4].copy_from_slice(&root_id.as_u32().to_le_bytes());
                true
            }
            None => false,
        }
    }

    /// Removes a record, compacting the tail down. Returns false if absent.
    pub fn delete_record(&mut self, name: &str) -> bool {
        let index = match self.find_record(name) {
            Some(index) => index,
            None => return false,
        };
        let count = self.record_count();

        let dst = RECORDS_OFFSET + index * RECORD_SIZE;
        let src = dst + RECORD_SIZE;
        let end = RECORDS_OFFSET + count * RECORD_SIZE;
        self.data.copy_within(src..end, dst);
        self.set_record_count(count - 1);
        true
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        view(self.data).find_record(name)
    }

    fn set_record_count(&mut self, count: usize) {
        self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .copy_from_slice(&(count as u32).to_le_bytes());
    }
}

/// Read-only view of a header page.
pub struct HeaderPageRef<'a> {
    data: &'a [u8],
}

fn view(data: &[u8]) -> HeaderPageRef<'_> {
    HeaderPageRef { data }
}

impl<'a> HeaderPageRef<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        assert_eq!(data.len(), PAGE_SIZE);
        Self { data }
    }

    pub fn record_count(&self) -> usize {
        let bytes: [u8; 4] = self.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]
            .try_into()
            .unwrap();
        u32::from_le_bytes(bytes) as usize
    }

    pub fn get_root_id(&self, name: &str) -> Option<PageId> {
        let index = self.find_record(name)?;
        let offset = RECORDS_OFFSET + index * RECORD_SIZE + NAME_SIZE;
        let bytes: [u8; 4] = self.data[offset..offset + 4].try_into().unwrap();
        Some(PageId::new(u32::from_le_bytes(bytes)))
    }

    fn find_record(&self, name: &str) -> Option<usize> {
        if name.len() > NAME_SIZE {
            return None;
        }
        let mut padded = [0u8; NAME_SIZE];
        padded[..name.len()].copy_from_slice(name.as_bytes());

        (0..self.record_count()).find(|&i| {
            let offset = RECORDS_OFFSET + i * RECORD_SIZE;
            self.data[offset..offset + NAME_SIZE] == padded
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_page_insert_and_get() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data);
        page.init();

        assert!(page.insert_record("orders_pk", PageId::new(3)));
        assert!(page.insert_record("orders_date", PageId::new(9)));
        assert!(!page.insert_record("orders_pk", PageId::new(4)));

        assert_eq!(page.record_count(), 2);
        assert_eq!(page.get_root_id("orders_pk"), Some(PageId::new(3)));
        assert_eq!(page.get_root_id("orders_date"), Some(PageId::new(9)));
        assert_eq!(page.get_root_id("missing"), None);
    }

    #[test]
    fn test_header_page_update() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data);
        page.init();

        page.insert_record("idx", PageId::new(1));
        assert!(page.update_record("idx", PageId::new(17)));
        assert_eq!(page.get_root_id("idx"), Some(PageId::new(17)));
        assert!(!page.update_record("other", PageId::new(2)));
    }

    #[test]
    fn test_header_page_delete_compacts() {
        let mut data = [0u8; PAGE_SIZE];
        let mut page = HeaderPage::new(&mut data);
        page.init();

        page.insert_record("a", PageId::new(1));
        page.insert_record("b", PageId::new(2));
        page.insert_record("c", PageId::new(3));

        assert!(page.delete_record("b"));
        assert_eq!(page.record_count(), 2);
        assert_eq!(page.get_root_id("a"), Some(PageId::new(1)));
        assert_eq!(page.get_root_id("b"), None);
        assert_eq!(page.get_root_id("c"), Some(PageId::new(3)));
    }
}
