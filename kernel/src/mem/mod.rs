// kernel/src/mem/mod.rs
//
// 役割:
// - メモリ関連のサブモジュールをまとめる中継点。
// - addr / layout / paging はハードウェア形式と定数だけ（副作用なし）。
// - refcount / address_space / cow がページングコア本体。

pub mod addr;
pub mod address_space;
pub mod cow;
pub mod layout;
pub mod paging;
pub mod refcount;
