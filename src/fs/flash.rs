//! Flash write engine.
//!
//! Turns "write these bytes at this address" into the erase and burn sequence
//! the NOR rules allow. A page is only erased when some byte needs a 0 turned
//! back into a 1; the page is then staged through a caller supplied scratch
//! page so that its untouched bytes survive.

use std::sync::Arc;

use log::{debug, trace};

use super::{FlashDevice, FlashError, ERASED_BYTE, PAGE_SIZE, WORD_SIZE};

/// Where the bytes of a write come from.
#[derive(Clone, Copy, Debug)]
pub enum Source<'a> {
    Bytes(&'a [u8]),
    /// Every byte takes the same value (memset / erase)
    Fill(u8),
}

impl<'a> Source<'a> {
    /// Fill `dst` with the first `dst.len()` bytes
    pub fn copy_into(&self, dst: &mut [u8]) {
        match self {
            Source::Bytes(b) => dst.copy_from_slice(&b[..dst.len()]),
            Source::Fill(v) => dst.fill(*v),
        }
    }

    /// The `len` bytes starting at `start`
    pub fn window(&self, start: usize, len: usize) -> Source<'a> {
        match *self {
            Source::Bytes(b) => Source::Bytes(&b[start..start + len]),
            Source::Fill(v) => Source::Fill(v),
        }
    }
}

/// true if writing `source` over `existing` would need some bit set back to 1
pub fn need_erase(source: &[u8], existing: &[u8]) -> bool {
    source
        .iter()
        .zip(existing)
        .any(|(&new, &old)| !old & new != 0)
}

fn pack_word(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[derive(Clone)]
pub struct Flash {
    device: Arc<dyn FlashDevice>,
}

impl Flash {
    pub fn new(device: Arc<dyn FlashDevice>) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &Arc<dyn FlashDevice> {
        &self.device
    }

    pub fn capacity(&self) -> usize {
        self.device.capacity()
    }

    fn check_range(&self, address: usize, len: usize) -> Result<(), FlashError> {
        match address.checked_add(len) {
            Some(end) if end <= self.device.capacity() => Ok(()),
            _ => Err(FlashError::OutOfRange { address, len }),
        }
    }

    fn check_page(&self, page: usize) -> Result<(), FlashError> {
        if page % PAGE_SIZE != 0 {
            return Err(FlashError::Unaligned { address: page });
        }
        self.check_range(page, PAGE_SIZE)
    }

    pub fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), FlashError> {
        self.check_range(address, buf.len())?;
        self.device.read(address, buf)
    }

    pub fn read_u16(&self, address: usize) -> Result<u16, FlashError> {
        let mut b = [0u8; 2];
        self.read(address, &mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&self, address: usize) -> Result<u32, FlashError> {
        let mut b = [0u8; 4];
        self.read(address, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// true if every byte of the range reads 0xFF
    pub fn is_erased(&self, address: usize, len: usize) -> Result<bool, FlashError> {
        let mut buf = vec![0u8; len];
        self.read(address, &mut buf)?;
        Ok(buf.iter().all(|&b| b == ERASED_BYTE))
    }

    /// true if writing `len` bytes of `source` at `address` needs a page erase
    pub fn needs_erase(
        &self,
        address: usize,
        source: Source,
        len: usize,
    ) -> Result<bool, FlashError> {
        let mut existing = vec![0u8; len];
        self.read(address, &mut existing)?;
        let mut wanted = vec![0u8; len];
        source.copy_into(&mut wanted);
        Ok(need_erase(&wanted, &existing))
    }

    pub fn erase_page(&self, page: usize) -> Result<(), FlashError> {
        self.check_page(page)?;
        trace!("erase page {:#x}", page);
        self.device.erase_page(page)
    }

    /// Write `buf` to `address`. `scratch` is only touched when an erase is needed.
    pub fn write(
        &self,
        address: usize,
        buf: &[u8],
        scratch: Option<usize>,
    ) -> Result<(), FlashError> {
        self.write_source(address, Source::Bytes(buf), buf.len(), scratch)
    }

    /// Set `len` bytes at `address` to `value`
    pub fn memset(
        &self,
        address: usize,
        value: u8,
        len: usize,
        scratch: Option<usize>,
    ) -> Result<(), FlashError> {
        self.write_source(address, Source::Fill(value), len, scratch)
    }

    /// Set `len` bytes at `address` back to 0xFF
    pub fn erase_mem(
        &self,
        address: usize,
        len: usize,
        scratch: Option<usize>,
    ) -> Result<(), FlashError> {
        self.memset(address, ERASED_BYTE, len, scratch)
    }

    pub fn write_source(
        &self,
        address: usize,
        source: Source,
        len: usize,
        scratch: Option<usize>,
    ) -> Result<(), FlashError> {
        self.check_range(address, len)?;
        let mut done = 0;
        while done < len {
            let current = address + done;
            let page = current - current % PAGE_SIZE;
            let offset = current - page;
            let n = (PAGE_SIZE - offset).min(len - done);
            self.write_page(page, offset, source.window(done, n), n, scratch)?;
            done += n;
        }
        Ok(())
    }

    /// Copy a whole page onto an erased page, skipping blank words
    pub fn copy_page(&self, from: usize, to: usize) -> Result<(), FlashError> {
        self.check_page(from)?;
        self.check_page(to)?;
        let mut image = [0u8; PAGE_SIZE];
        self.device.read(from, &mut image)?;
        self.burn_image(to, &image)
    }

    fn burn_image(&self, page: usize, image: &[u8; PAGE_SIZE]) -> Result<(), FlashError> {
        for (i, chunk) in image.chunks(WORD_SIZE).enumerate() {
            let word = pack_word(chunk);
            if word != u32::MAX {
                self.device.burn(page + i * WORD_SIZE, &[word])?;
            }
        }
        Ok(())
    }

    fn write_page(
        &self,
        page: usize,
        offset: usize,
        source: Source,
        len: usize,
        scratch: Option<usize>,
    ) -> Result<(), FlashError> {
        let mut image = [0u8; PAGE_SIZE];
        self.device.read(page, &mut image)?;
        let mut updated = image;
        source.copy_into(&mut updated[offset..offset + len]);

        if !need_erase(&updated[offset..offset + len], &image[offset..offset + len]) {
            // only the words covering the range are burned
            let start = offset & !(WORD_SIZE - 1);
            let end = (offset + len + WORD_SIZE - 1) & !(WORD_SIZE - 1);
            for w in (start..end).step_by(WORD_SIZE) {
                if updated[w..w + WORD_SIZE] != image[w..w + WORD_SIZE] {
                    self.device.burn(page + w, &[pack_word(&updated[w..w + WORD_SIZE])])?;
                }
            }
            return Ok(());
        }

        let scratch = scratch.ok_or(FlashError::NoScratch)?;
        self.check_page(scratch)?;
        if scratch == page {
            return Err(FlashError::ScratchOverlap { page });
        }
        debug!("rewrite page {:#x} through scratch {:#x}", page, scratch);

        if !self.is_erased(scratch, PAGE_SIZE)? {
            self.device.erase_page(scratch)?;
        }
        self.burn_image(scratch, &image)?;
        self.device.erase_page(page)?;

        let mut staged = [0u8; PAGE_SIZE];
        self.device.read(scratch, &mut staged)?;
        staged[offset..offset + len].copy_from_slice(&updated[offset..offset + len]);
        self.burn_image(page, &staged)
    }
}
