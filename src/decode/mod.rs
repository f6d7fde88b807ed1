// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol-specific message decoders. Each submodule turns framed,
//! protocol-detected bytes into an owned, neutral record the correlators can
//! hold for the life of a session.

pub mod diameter;
pub mod gtpv2;
pub mod pfcp;
pub mod rtp;
pub mod s1ap;
pub mod sip;
pub mod tbcd;
