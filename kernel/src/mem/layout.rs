// kernel/src/mem/layout.rs

// i386 仮想アドレスレイアウト（固定値）
//
// 目的:
// - 「ユーザ空間」と「カーネル空間＋物理メモリ窓(linear map)」の境界を固定しておく。
// - ここの定数を変えることで「OSが守るべきアドレス空間の型」を更新できる。
//
// 想定レイアウト:
//
//   0x0000_0000 ..= 0xbfff_ffff
//     - user 空間（PDE 0..768）
//     - プロセスごとに異なるマッピングを持ち、clone 時に COW 対象になる
//
//   0xc000_0000 ..= 0xf7ff_ffff
//     - kernel linear map（物理 0 から LINEAR_MAPPING_SIZE 分を 4MiB superpage で直写像）
//     - get_mapping はこの範囲を扱わない（単純な引き算で求まるため）
//
//   0xf800_0000 ..
//     - kernel の 4KiB マッピング領域。先頭に vdso 風トランポリンページを置く。
//
// kernel 側の PDE は clone 時に値コピーされ、page table は全アドレス空間で共有される。

use super::addr::{PhysAddr, VirtAddr};

pub const MB: u32 = 1024 * 1024;

/// kernel / user の境界
pub const KERNEL_BASE_VA: u32 = 0xc000_0000;

/// kernel 側の最初の PDE index（768）
pub const KERNEL_PDE_START: usize = (KERNEL_BASE_VA >> 22) as usize;

/// linear map のサイズ
pub const LINEAR_MAPPING_SIZE: u32 = 896 * MB;

/// linear map の終端（exclusive）
pub const LINEAR_MAPPING_END: u32 = KERNEL_BASE_VA + LINEAR_MAPPING_SIZE;

/// sysenter 用の共有トランポリンページ。
/// kernel 空間にありながら user から読める唯一のページ。
pub const USER_VDSO_VADDR: u32 = LINEAR_MAPPING_END;

/// linear map 内のアドレスか
pub const fn is_linear_mapped(vaddr: VirtAddr) -> bool {
    vaddr.0 >= KERNEL_BASE_VA && vaddr.0 < LINEAR_MAPPING_END
}

/// kernel linear map 上の仮想アドレス → 物理アドレス
pub const fn kernel_va_to_pa(vaddr: VirtAddr) -> PhysAddr {
    PhysAddr(vaddr.0 - KERNEL_BASE_VA)
}

/// 物理アドレス → kernel linear map 上の仮想アドレス
pub const fn kernel_pa_to_va(paddr: PhysAddr) -> VirtAddr {
    VirtAddr(paddr.0 + KERNEL_BASE_VA)
}
