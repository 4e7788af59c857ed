// kernel/src/kernel/trace.rs
//
// 低コスト trace（観測性）を 1 箇所に集約する。
// - resolve_cow がどの経路を通ったか（not_cow / fast / copy）
// - clone / destroy の発生
//
// 設計方針:
// - logging 側に新 API を要求しない（info のみで完結）
// - no_std 前提で heap 確保なし（固定文字列）
//
// feature:
// - cow_trace: 有効時のみ 1 イベント 1 行を出す。無効時は何も生成しない。

// CowTraceEvent は “常に存在” させる（feature off でもコンパイル可能にする）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CowTraceEvent {
    NotCow,
    MadeWritable,
    Copied,
    Clone,
    Destroy,
}

#[inline(always)]
pub fn trace_cow(ev: CowTraceEvent) {
    #[cfg(feature = "cow_trace")]
    {
        match ev {
            CowTraceEvent::NotCow => crate::logging::info("cow_trace resolve=not_cow"),
            CowTraceEvent::MadeWritable => crate::logging::info("cow_trace resolve=fast"),
            CowTraceEvent::Copied => crate::logging::info("cow_trace resolve=copy"),
            CowTraceEvent::Clone => crate::logging::info("cow_trace pdir=clone"),
            CowTraceEvent::Destroy => crate::logging::info("cow_trace pdir=destroy"),
        }
    }
    #[cfg(not(feature = "cow_trace"))]
    {
        let _ = ev;
    }
}
