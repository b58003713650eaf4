//! raft-rs's `RawNode` takes a mandatory `slog::Logger`. The rest of the
//! stack standardizes on the `log` facade (SPEC_FULL.md §7.1), so rather
//! than carry a second logging story this bridges `slog` records straight
//! into it via `slog-stdlog`.

use slog::Drain;

pub fn bridge_logger() -> slog::Logger {
    slog::Logger::root(slog_stdlog::StdLog.fuse(), slog::o!())
}
