// kernel/src/lib.rs
//
// i386 仮想メモリサブシステム。
//
// - mem: ページテーブル形式・参照カウント・アドレス空間操作・COW
// - mm: フレームアロケータと物理メモリ窓
// - arch: CPU / MMU / 例外処理の境界（実機では asm、テストでは差し替え）
// - kernel: 起動手順と例外入口からの参照点
// - logging / panic: 観測性と fail-stop
//
// ハードウェアはすべて trait 越しに触るので、ホスト上で cargo test できる。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod kernel;
pub mod logging;
pub mod mem;
pub mod mm;
pub mod panic;
pub mod types;
