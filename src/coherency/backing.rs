//! Backing store consulted when no node holds a valid copy of a line, and the
//! destination of writebacks.

use dashmap::DashMap;

use super::types::{Address, PAGE_SIZE, page_base};

pub trait BackingStore: Send + Sync {
    fn load(&self, address: Address, size: usize) -> anyhow::Result<Vec<u8>>;

    fn store(&self, address: Address, data: &[u8]) -> anyhow::Result<()>;
}

/// Sparse in-memory store. Never-written bytes read as zero.
#[derive(Default)]
pub struct MemoryBackingStore {
    pages: DashMap<Address, Box<[u8; PAGE_SIZE]>>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.len()
    }
}

impl BackingStore for MemoryBackingStore {
    fn load(&self, address: Address, size: usize) -> anyhow::Result<Vec<u8>> {
        let mut out = vec![0u8; size];
        let mut copied = 0usize;

        while copied < size {
            let cursor = address
                .checked_add(copied as Address)
                .ok_or_else(|| anyhow::anyhow!("address overflow at {:#x}", address))?;
            let base = page_base(cursor);
            let offset = (cursor - base) as usize;
            let len = (PAGE_SIZE - offset).min(size - copied);

            if let Some(page) = self.pages.get(&base) {
                out[copied..copied + len].copy_from_slice(&page[offset..offset + len]);
            }
            copied += len;
        }

        Ok(out)
    }

    fn store(&self, address: Address, data: &[u8]) -> anyhow::Result<()> {
        let mut written = 0usize;

        while written < data.len() {
            let cursor = address
                .checked_add(written as Address)
                .ok_or_else(|| anyhow::anyhow!("address overflow at {:#x}", address))?;
            let base = page_base(cursor);
            let offset = (cursor - base) as usize;
            let len = (PAGE_SIZE - offset).min(data.len() - written);

            let mut page = self
                .pages
                .entry(base)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE]));
            page[offset..offset + len].copy_from_slice(&data[written..written + len]);
            written += len;
        }

        Ok(())
    }
}
