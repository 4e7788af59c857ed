// kernel/src/arch/mod.rs
//
// アーキ依存部。unsafe をできるだけここに閉じ込める方針。
// - cpu: hlt_loop / port I/O / Cpu trait（CR2, EFLAGS.IF, sti/cli）
// - paging: Mmu trait（INVLPG, CR3）と kernel page directory の固定領域
// - interrupts: #PF / #GP の判断ロジックと登録・報告の trait

pub mod cpu;
pub mod interrupts;
pub mod paging;

/// CPU を停止させるループ
pub fn halt_loop() -> ! {
    cpu::halt_loop()
}
