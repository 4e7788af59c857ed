// kernel/src/arch/paging.rs
//
// 役割:
// - i386 の MMU 操作（INVLPG / CR3 ロード / TLB 全消去）をまとめる場所。
// - ページングコア（mem::address_space, mem::cow）は Mmu trait 越しにだけ呼ぶ。
//
// やること:
// - Mmu trait の定義
// - 実機用 X86Mmu と、kernel page directory の固定領域
//
// やらないこと:
// - ページテーブルの中身の操作（mem 側）

use crate::mem::addr::{PhysAddr, VirtAddr};

/// TLB と root レジスタの操作。
///
/// 単一コア前提なので invalidate はローカル CPU だけでよい。
pub trait Mmu {
    /// vaddr 1 ページぶんの TLB entry を捨てる（INVLPG）
    fn invalidate_page(&mut self, vaddr: VirtAddr);
    /// root を page directory として載せる（CR3 書き込み）
    fn load_root(&mut self, root: PhysAddr);
    /// global 以外の TLB entry をすべて捨てる（CR3 再ロード）
    fn flush_all(&mut self);
    /// 4MiB ページと global ページを有効にする（CR4.PSE / CR4.PGE）
    fn enable_large_pages(&mut self);
}

#[cfg(target_arch = "x86")]
pub use self::x86::{kernel_dir_frame, X86Mmu};

#[cfg(target_arch = "x86")]
mod x86 {
    use super::Mmu;
    use crate::mem::addr::{PhysAddr, PhysFrame, VirtAddr};
    use crate::mem::layout::{kernel_va_to_pa, KERNEL_BASE_VA};
    use crate::mem::paging::PageDirectory;

    // kernel page directory の固定領域（bss、4KiB 境界）
    static mut KERNEL_PDIR_BUF: PageDirectory = PageDirectory::new();

    /// 固定領域の物理フレーム（kernel image は linear map 上にある前提）
    pub fn kernel_dir_frame() -> PhysFrame {
        let va = core::ptr::addr_of!(KERNEL_PDIR_BUF) as u32;
        debug_assert!(va >= KERNEL_BASE_VA);
        kernel_va_to_pa(VirtAddr(va)).frame()
    }

    pub struct X86Mmu;

    impl Mmu for X86Mmu {
        fn invalidate_page(&mut self, vaddr: VirtAddr) {
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) vaddr.0, options(nostack, preserves_flags));
            }
        }

        fn load_root(&mut self, root: PhysAddr) {
            unsafe {
                core::arch::asm!("mov cr3, {}", in(reg) root.0, options(nostack, preserves_flags));
            }
        }

        fn flush_all(&mut self) {
            unsafe {
                core::arch::asm!(
                    "mov {tmp}, cr3",
                    "mov cr3, {tmp}",
                    tmp = out(reg) _,
                    options(nostack, preserves_flags),
                );
            }
        }

        fn enable_large_pages(&mut self) {
            const CR4_PSE: u32 = 1 << 4;
            const CR4_PGE: u32 = 1 << 7;
            unsafe {
                core::arch::asm!(
                    "mov {tmp}, cr4",
                    "or {tmp}, {bits}",
                    "mov cr4, {tmp}",
                    tmp = out(reg) _,
                    bits = const CR4_PSE | CR4_PGE,
                    options(nostack),
                );
            }
        }
    }
}
