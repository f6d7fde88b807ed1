// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

pub mod reassembler;

pub use reassembler::{
    ReassemblyCallbacks, Stats as ReassemblerStats, TcpFlags, TcpReassembler, TcpSegment,
    TcpStreamState, TcpState,
};
