//! Block index to flash address translation.
//!
//! All address arithmetic of MBFS lives here; the rest of the filesystem only
//! deals in block numbers and directory entry references.

use super::super::{MBFS_BLOCK_SIZE, PAGE_SIZE};
use super::layout::DIRENT_SIZE;
use super::DirentRef;

pub const BLOCKS_PER_PAGE: u16 = (PAGE_SIZE / MBFS_BLOCK_SIZE) as u16;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Geometry {
    flash_start: usize,
    blocks: u16,
}

impl Geometry {
    pub fn new(flash_start: usize, pages: usize) -> Self {
        Self {
            flash_start,
            blocks: (pages * BLOCKS_PER_PAGE as usize) as u16,
        }
    }

    pub fn flash_start(&self) -> usize {
        self.flash_start
    }

    /// Number of logical blocks, which is also the number of file table entries
    pub fn blocks(&self) -> u16 {
        self.blocks
    }

    pub fn pages(&self) -> usize {
        (self.blocks / BLOCKS_PER_PAGE) as usize
    }

    /// First byte past the filesystem region
    pub fn end(&self) -> usize {
        self.flash_start + self.pages() * PAGE_SIZE
    }

    /// Blocks needed to hold one u16 table entry per block
    pub fn table_size(&self) -> u16 {
        let bytes = self.blocks as usize * 2;
        ((bytes + MBFS_BLOCK_SIZE - 1) / MBFS_BLOCK_SIZE) as u16
    }

    pub fn block_address(&self, block: u16) -> usize {
        self.flash_start + block as usize * MBFS_BLOCK_SIZE
    }

    pub fn page_address(&self, block: u16) -> usize {
        self.block_address(self.first_block_of_page(block))
    }

    pub fn first_block_of_page(&self, block: u16) -> u16 {
        block - block % BLOCKS_PER_PAGE
    }

    pub fn table_entry_address(&self, block: u16) -> usize {
        self.flash_start + block as usize * 2
    }

    pub fn dirent_address(&self, dirent: DirentRef) -> usize {
        self.block_address(dirent.block) + dirent.slot as usize * DIRENT_SIZE
    }

    pub fn contains(&self, block: u16) -> bool {
        block < self.blocks
    }
}
