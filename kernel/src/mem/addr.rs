// src/mem/addr.rs
//
// 役割:
// - 物理アドレス / 仮想アドレス / フレームなど、メモリ関連の基本型を定義する。
// - i386 (32-bit) 前提なので中身は u32。
// やること:
// - u32 の生アドレス値に対して、「これは物理アドレス」「これは仮想アドレス」と区別できるようにする。
// - 2 段ページング用の index 計算（PDE index / PTE index）。
// やらないこと:
// - ページテーブルのエントリを直接触る処理は書かない（それは mem::paging 側で行う）。

use core::fmt;

/// 物理アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysAddr(pub u32);

/// 仮想アドレス（バイト単位）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(pub u32);

/// ページサイズ（4KiB 固定）
pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// superpage（PDE 1 個が直接マップする範囲: 4MiB）
pub const LARGE_PAGE_SIZE: u32 = 4 * 1024 * 1024;

/// 1 テーブル（PD / PT）あたりのエントリ数
pub const ENTRIES_PER_TABLE: usize = 1024;

/// 物理フレーム（4KiB ごとの番号）
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysFrame {
    pub number: u32, // frame index = phys_addr / PAGE_SIZE
}

impl PhysAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> PhysAddr {
        PhysAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    pub const fn is_large_page_aligned(self) -> bool {
        self.0 & (LARGE_PAGE_SIZE - 1) == 0
    }

    /// このアドレスが含まれる物理フレームを返す。
    pub const fn frame(self) -> PhysFrame {
        PhysFrame {
            number: self.0 >> PAGE_SHIFT,
        }
    }
}

impl VirtAddr {
    /// 下位ビットを切り捨てて、ページ境界に揃える。
    pub const fn align_down(self) -> VirtAddr {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    pub const fn is_large_page_aligned(self) -> bool {
        self.0 & (LARGE_PAGE_SIZE - 1) == 0
    }

    /// ページディレクトリ index（bits 31..22）
    pub const fn pd_index(self) -> usize {
        (self.0 >> 22) as usize
    }

    /// ページテーブル index（bits 21..12）
    pub const fn pt_index(self) -> usize {
        ((self.0 >> PAGE_SHIFT) & 0x3ff) as usize
    }
}

impl PhysFrame {
    /// フレーム先頭の物理アドレスを返す。
    pub const fn start_address(self) -> PhysAddr {
        PhysAddr(self.number << PAGE_SHIFT)
    }

    /// インデックスから直接フレームを作る（テスト用途など）。
    pub const fn from_index(number: u32) -> Self {
        PhysFrame { number }
    }

    /// ページ境界の物理アドレスからフレームを作る。境界でなければ None。
    pub const fn from_start_address(addr: PhysAddr) -> Option<Self> {
        if addr.is_page_aligned() {
            Some(addr.frame())
        } else {
            None
        }
    }
}

// --- Debug 実装（ログで見やすくするため） ---

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Debug for PhysFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // フレーム先頭の物理アドレスを表示
        write!(f, "PhysFrame({:#x})", self.start_address().0)
    }
}
