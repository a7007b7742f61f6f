//! User address space constants and page arithmetic.

use minos_fs::structs::SECTOR_SIZE;
use static_assertions::const_assert;

pub const PG_SIZE: usize = 4096;
pub const PG_SHIFT: usize = 12;

/// Addresses at or above this belong to the kernel.
pub const PHYS_BASE: usize = 0xC000_0000;
/// Lowest mappable user address.
pub const USER_BASE: usize = 0x0804_8000;
/// The user stack may not grow past this many bytes below `PHYS_BASE`.
pub const STACK_LIMIT: usize = 1 << 23;

/// Device sectors holding one page.
pub const SECTORS_PER_PAGE: usize = PG_SIZE / SECTOR_SIZE;

pub fn pg_round_down(addr: usize) -> usize {
    addr & !(PG_SIZE - 1)
}

pub fn pg_round_up(addr: usize) -> usize {
    (addr + PG_SIZE - 1) & !(PG_SIZE - 1)
}

pub fn pg_ofs(addr: usize) -> usize {
    addr & (PG_SIZE - 1)
}

const_assert!(PG_SIZE % SECTOR_SIZE == 0);
const_assert!(SECTORS_PER_PAGE == 8);
