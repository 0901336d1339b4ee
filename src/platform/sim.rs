//! Simulated devices
//!
//! RAM-backed flash and an outbox radio. Used on hosts and by the tests;
//! the flash keeps real NOR semantics (erase to `0xFF`, program clears bits)
//! so cache bugs that would corrupt a real part show up here too.

use super::{FlashDevice, NodeAddr, PlatformError, PlatformResult, Radio};
use std::collections::VecDeque;

/// RAM-backed flash
#[derive(Debug, Clone)]
pub struct SimFlash {
    base: u32,
    page_size: usize,
    data: Vec<u8>,
    /// Number of page erase cycles performed
    pub erase_count: u64,
    /// Number of program operations performed
    pub program_count: u64,
}

impl SimFlash {
    /// Create an erased device of `page_count` pages
    pub fn new(base: u32, page_size: usize, page_count: usize) -> Self {
        Self {
            base,
            page_size,
            data: vec![0xFF; page_size * page_count],
            erase_count: 0,
            program_count: 0,
        }
    }

    fn range(&self, addr: u32, len: usize) -> PlatformResult<std::ops::Range<usize>> {
        let start = addr
            .checked_sub(self.base)
            .map(|o| o as usize)
            .ok_or(PlatformError::OutOfRange { addr, len })?;
        let end = start
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(PlatformError::OutOfRange { addr, len })?;
        Ok(start..end)
    }

    /// Raw view of the device contents
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl FlashDevice for SimFlash {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn base_addr(&self) -> u32 {
        self.base
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn erase_page(&mut self, addr: u32) -> PlatformResult<()> {
        let range = self.range(addr, self.page_size)?;
        self.data[range].fill(0xFF);
        self.erase_count += 1;
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> PlatformResult<()> {
        let range = self.range(addr, data.len())?;
        let start = range.start;
        for (i, &byte) in data.iter().enumerate() {
            let cell = &mut self.data[start + i];
            // NOR flash can only clear bits
            if *cell & byte != byte {
                return Err(PlatformError::NotErased {
                    addr: addr + i as u32,
                });
            }
            *cell = byte;
        }
        self.program_count += 1;
        Ok(())
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> PlatformResult<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }
}

/// Outbox radio: frames are queued for the test or host loop to deliver
#[derive(Debug, Default)]
pub struct SimRadio {
    addr: NodeAddr,
    outbox: VecDeque<(NodeAddr, Vec<u8>)>,
    /// Total frames sent
    pub sent_count: u64,
}

impl SimRadio {
    pub fn new(addr: NodeAddr) -> Self {
        Self {
            addr,
            outbox: VecDeque::new(),
            sent_count: 0,
        }
    }

    /// Take every queued frame, oldest first
    pub fn drain(&mut self) -> Vec<(NodeAddr, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    /// Number of frames waiting in the outbox
    pub fn pending(&self) -> usize {
        self.outbox.len()
    }
}

impl Radio for SimRadio {
    fn local_addr(&self) -> NodeAddr {
        self.addr
    }

    fn send(&mut self, dest: NodeAddr, frame: Vec<u8>) -> PlatformResult<()> {
        self.outbox.push_back((dest, frame));
        self.sent_count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_starts_erased() {
        let flash = SimFlash::new(0x1000, 64, 4);
        let mut buf = [0u8; 8];
        flash.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [0xFF; 8]);
        assert_eq!(flash.size(), 256);
    }

    #[test]
    fn test_program_requires_erase() {
        let mut flash = SimFlash::new(0, 64, 2);
        flash.program(0, &[0x12, 0x34]).unwrap();

        // Setting bits back to 1 needs an erase
        assert_eq!(
            flash.program(0, &[0xFF]),
            Err(PlatformError::NotErased { addr: 0 })
        );

        flash.erase_page(0).unwrap();
        flash.program(0, &[0xAB]).unwrap();
        let mut buf = [0u8; 1];
        flash.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0xAB]);
        assert_eq!(flash.erase_count, 1);
        assert_eq!(flash.program_count, 2);
    }

    #[test]
    fn test_flash_bounds() {
        let mut flash = SimFlash::new(0x100, 16, 1);
        let mut buf = [0u8; 4];
        assert!(flash.read(0x0FF, &mut buf).is_err());
        assert!(flash.read(0x10E, &mut buf).is_err());
        assert!(flash.erase_page(0x110).is_err());
    }

    #[test]
    fn test_radio_outbox() {
        let mut radio = SimRadio::new(7);
        radio.send(3, vec![1, 2]).unwrap();
        radio.send(4, vec![3]).unwrap();
        assert_eq!(radio.pending(), 2);

        let frames = radio.drain();
        assert_eq!(frames, vec![(3, vec![1, 2]), (4, vec![3])]);
        assert_eq!(radio.pending(), 0);
        assert_eq!(radio.sent_count, 2);
    }
}
