// kernel/src/mem/paging.rs
//
// 役割:
// - i386 2 段ページングのエントリ / テーブルのバイナリ形式を定義する。
// - PDE / PTE はどちらも 32-bit。ハードウェアの形式とビット単位で一致させる。
//
// ビット配置（PTE / PDE 共通部分）:
//   31..12  フレーム物理アドレス（superpage PDE は 31..22）
//   11..9   available（ソフトウェア用。bit 9 = COW_ORIGINAL_WRITABLE）
//   8       GLOBAL
//   7       PDE: PS(4MiB) / PTE: PAT
//   6..0    DIRTY ACCESSED PCD PWT USER WRITABLE PRESENT

use core::ops::{Index, IndexMut};

use crate::mem::addr::{PhysAddr, PhysFrame, ENTRIES_PER_TABLE, LARGE_PAGE_SIZE};

bitflags::bitflags! {
    /// ページ属性
    ///
    /// - PRESENT: ページが有効
    /// - WRITABLE: 書き込み可能
    /// - USER: ユーザ空間からアクセス可能
    /// - GLOBAL: CR3 切替で TLB から落ちない（kernel 専用）
    /// - COW_ORIGINAL_WRITABLE: COW 共有前は書き込み可能だった
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// ページが有効かどうか
        const PRESENT = 1 << 0;
        /// 書き込み可能かどうか
        const WRITABLE = 1 << 1;
        /// ユーザ空間からアクセス可能かどうか
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// PDE のみ: 4MiB superpage
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        /// available bit 0。read-only 化された COW ページの元の権限。
        const COW_ORIGINAL_WRITABLE = 1 << 9;
    }
}

const FLAGS_MASK: u32 = 0x0000_0fff;
const FRAME_MASK: u32 = 0xffff_f000;
const LARGE_FRAME_MASK: u32 = 0xffc0_0000;

/// PTE: 4KiB ページ 1 枚のマッピング
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        PageTableEntry(0)
    }

    pub fn new(frame: PhysFrame, flags: PageFlags) -> Self {
        PageTableEntry(frame.start_address().0 | (flags.bits() & FLAGS_MASK))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageFlags::WRITABLE)
    }

    pub fn is_cow(self) -> bool {
        self.flags().contains(PageFlags::COW_ORIGINAL_WRITABLE)
    }

    pub const fn frame(self) -> PhysFrame {
        PhysAddr(self.0 & FRAME_MASK).frame()
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & FRAME_MASK) | (flags.bits() & FLAGS_MASK);
    }

    pub fn set_frame(&mut self, frame: PhysFrame) {
        self.0 = frame.start_address().0 | (self.0 & FLAGS_MASK);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("frame", &self.frame())
            .field("flags", &self.flags())
            .finish()
    }
}

/// PDE: page table を指す / 4MiB を直接マップする / 無効、のいずれか
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageDirEntry(u32);

impl PageDirEntry {
    pub const fn empty() -> Self {
        PageDirEntry(0)
    }

    /// page table を指すエントリ
    pub fn table(table_frame: PhysFrame, flags: PageFlags) -> Self {
        debug_assert!(!flags.contains(PageFlags::HUGE_PAGE));
        PageDirEntry(table_frame.start_address().0 | (flags.bits() & FLAGS_MASK))
    }

    /// 4MiB superpage エントリ
    pub fn large(paddr: PhysAddr, flags: PageFlags) -> Self {
        assert!(paddr.0 & (LARGE_PAGE_SIZE - 1) == 0, "superpage paddr must be 4MiB-aligned");
        PageDirEntry(paddr.0 | ((flags | PageFlags::HUGE_PAGE).bits() & FLAGS_MASK))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & FLAGS_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    pub fn is_large(self) -> bool {
        self.flags().contains(PageFlags::HUGE_PAGE)
    }

    /// page table の物理フレーム（superpage では意味を持たない）
    pub const fn table_frame(self) -> PhysFrame {
        PhysAddr(self.0 & FRAME_MASK).frame()
    }

    /// superpage の先頭物理アドレス
    pub const fn large_base(self) -> PhysAddr {
        PhysAddr(self.0 & LARGE_FRAME_MASK)
    }

    pub fn set_table_frame(&mut self, table_frame: PhysFrame) {
        self.0 = table_frame.start_address().0 | (self.0 & FLAGS_MASK);
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl core::fmt::Debug for PageDirEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirEntry")
            .field("raw", &format_args!("{:#010x}", self.0))
            .field("flags", &self.flags())
            .finish()
    }
}

/// page table: 1024 PTE、ちょうど 1 フレーム
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

/// page directory: 1024 PDE、ちょうど 1 フレーム。アドレス空間の root。
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PageDirEntry; ENTRIES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == 4096);
const _: () = assert!(core::mem::size_of::<PageDirectory>() == 4096);

impl PageTable {
    pub const fn new() -> Self {
        PageTable {
            entries: [PageTableEntry::empty(); ENTRIES_PER_TABLE],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut PageTableEntry> {
        self.entries.iter_mut()
    }
}

impl PageDirectory {
    pub const fn new() -> Self {
        PageDirectory {
            entries: [PageDirEntry::empty(); ENTRIES_PER_TABLE],
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

impl Index<usize> for PageDirectory {
    type Output = PageDirEntry;

    fn index(&self, index: usize) -> &PageDirEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageDirectory {
    fn index_mut(&mut self, index: usize) -> &mut PageDirEntry {
        &mut self.entries[index]
    }
}
