//! Flag bits consumed by the public operations. Environment/database
//! flags and per-operation flags share one namespace, like the rest of
//! the engine they are plain `u32` bitmasks.

// environment flags
pub const ENV_IN_MEMORY: u32 = 0x0000_0001;
pub const ENV_READ_ONLY: u32 = 0x0000_0002;
pub const ENV_ENABLE_TRANSACTIONS: u32 = 0x0000_0004;
pub const ENV_ENABLE_RECOVERY: u32 = 0x0000_0008;
/// implies `ENV_ENABLE_RECOVERY`
pub const ENV_AUTO_RECOVERY: u32 = 0x0000_0010;
/// accepted for compatibility; I/O is always positioned read/write
pub const ENV_DISABLE_MMAP: u32 = 0x0000_0020;
pub const ENV_DISABLE_RECLAIM: u32 = 0x0000_0040;
pub const ENV_ENABLE_CRC32: u32 = 0x0000_0080;
pub const ENV_AUTO_CLEANUP: u32 = 0x0000_0100;

// database flags
pub const DB_ENABLE_DUPLICATE_KEYS: u32 = 0x0000_0200;
pub const DB_RECORD_NUMBER32: u32 = 0x0000_0400;
pub const DB_RECORD_NUMBER64: u32 = 0x0000_0800;

// insert flags
pub const OVERWRITE: u32 = 0x0001_0000;
pub const DUPLICATE: u32 = 0x0002_0000;
pub const DUPLICATE_INSERT_BEFORE: u32 = 0x0004_0000;
pub const DUPLICATE_INSERT_AFTER: u32 = 0x0008_0000;
pub const DUPLICATE_INSERT_FIRST: u32 = 0x0010_0000;
pub const DUPLICATE_INSERT_LAST: u32 = 0x0020_0000;
pub const HINT_APPEND: u32 = 0x0040_0000;
pub const HINT_PREPEND: u32 = 0x0080_0000;

// find flags; LEQ/GEQ combine the exact bit with a direction
pub const FIND_LT_MATCH: u32 = 0x0100_0000;
pub const FIND_GT_MATCH: u32 = 0x0200_0000;
pub const FIND_EXACT_MATCH: u32 = 0x0400_0000;
pub const FIND_LEQ_MATCH: u32 = FIND_EXACT_MATCH | FIND_LT_MATCH;
pub const FIND_GEQ_MATCH: u32 = FIND_EXACT_MATCH | FIND_GT_MATCH;

// cursor move flags
pub const CURSOR_FIRST: u32 = 0x0000_1000;
pub const CURSOR_LAST: u32 = 0x0000_2000;
pub const CURSOR_NEXT: u32 = 0x0000_4000;
pub const CURSOR_PREVIOUS: u32 = 0x0000_8000;
pub const SKIP_DUPLICATES: u32 = 0x1000_0000;

pub fn is_approx_find(flags: u32) -> bool {
    flags & (FIND_LT_MATCH | FIND_GT_MATCH) != 0
}
