//! Aggregate statistics and the debug dump.

use core::fmt;

use super::{HEADER_SIZE, Heap};
use crate::source::PageSource;

/// A snapshot of the heap's occupancy, gathered in a single list scan.
///
/// Used space counts every header, the sentinels included, plus the payloads
/// of used chunks. Free space counts the payloads of free chunks. Together
/// they always add up to the arena size.
///
/// # Example
///
/// ```
/// # use brkheap::{Heap, source::NoPages};
/// let heap = Heap::new(NoPages);
/// let stats = heap.stats();
/// assert_eq!(stats.used_space, 0);
/// eprintln!("{}", stats);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeapStats {
    pub used_space: usize,
    pub free_space: usize,
    /// Used chunks, counting the two sentinels.
    pub used_block_count: usize,
    pub free_gap_count: usize,
    pub largest_used_block: usize,
    pub largest_free_block: usize,
}

impl HeapStats {
    /// Returns the arena size the figures account for.
    #[inline]
    pub const fn total_space(&self) -> usize {
        self.used_space + self.free_space
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"Stat                 | Value
---------------------|--------------------
Used Space           | {:>19}
Free Space           | {:>19}
Total Space          | {:>19}
Used Blocks          | {:>19}
Free Gaps            | {:>19}
Largest Used Block   | {:>19}
Largest Free Block   | {:>19}"#,
            self.used_space,
            self.free_space,
            self.total_space(),
            self.used_block_count,
            self.free_gap_count,
            self.largest_used_block,
            self.largest_free_block,
        )
    }
}

impl<S: PageSource> Heap<S> {
    /// Gather all aggregate figures at once. All zero if uninitialized.
    pub fn stats(&self) -> HeapStats {
        if !self.initialized {
            return HeapStats::default();
        }

        let mut stats = HeapStats {
            used_space: 2 * HEADER_SIZE,
            used_block_count: self.used_count,
            free_gap_count: self.free_count,
            ..HeapStats::default()
        };

        for (_, header) in self.chunks().take(self.max_chunks()) {
            stats.used_space += HEADER_SIZE;
            if header.is_free() {
                stats.free_space += header.size;
                stats.largest_free_block = stats.largest_free_block.max(header.size);
            } else {
                stats.used_space += header.size;
                stats.largest_used_block = stats.largest_used_block.max(header.size);
            }
        }

        stats
    }

    pub fn used_space(&self) -> usize {
        self.stats().used_space
    }

    pub fn free_space(&self) -> usize {
        self.stats().free_space
    }

    /// Number of used chunks, sentinels included.
    pub fn used_block_count(&self) -> usize {
        if self.initialized { self.used_count } else { 0 }
    }

    pub fn free_gap_count(&self) -> usize {
        if self.initialized { self.free_count } else { 0 }
    }

    pub fn largest_used_block(&self) -> usize {
        self.stats().largest_used_block
    }

    pub fn largest_free_block(&self) -> usize {
        self.stats().largest_free_block
    }

    /// Write a table of every chunk, followed by the aggregate figures.
    ///
    /// Tolerates a damaged list: the walk stops at the first link that leaves the arena.
    pub fn dump_debug_info<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        if !self.initialized {
            return writeln!(out, "heap is not initialized");
        }

        writeln!(out, "arena: {}", self.arena)?;
        writeln!(out, "{:>5} | {:<18} | {:>12} | {:<4} | call site", "index", "address", "size", "free")?;
        writeln!(out, "------|--------------------|--------------|------|----------")?;

        for (index, (chunk, header)) in self.all_chunks().take(self.max_chunks()).enumerate() {
            write!(
                out,
                "{:>5} | {:<18p} | {:>12} | {:<4} | ",
                index,
                self.arena.base().wrapping_add(chunk),
                header.size,
                if header.is_free() { "yes" } else { "no" },
            )?;
            match header.site() {
                Some(site) => writeln!(out, "{}", site)?,
                None => writeln!(out, "--")?,
            }
        }

        writeln!(out)?;
        writeln!(out, "{}", self.stats())
    }
}
