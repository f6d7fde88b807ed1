// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S1AP neutral record (3GPP TS 36.413). The original consumes a PER ASN.1
//! decoder as an external black box (spec §1 scope note); this crate does
//! not reimplement PER decoding, it exposes the shape S1AP messages take
//! once a PER decoder has produced protocol IEs, so the Field Registry has
//! somewhere to read procedure-code, NAS-PDU, and UE-S1AP-Id from.

#[derive(Debug, Clone)]
pub struct ProtocolIe {
    pub id: u16,
    pub criticality: u8,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct S1apMessage {
    pub procedure_code: u8,
    pub ies: Vec<ProtocolIe>,
}

pub mod ie_id {
    pub const MME_UE_S1AP_ID: u16 = 0;
    pub const ENB_UE_S1AP_ID: u16 = 8;
    pub const NAS_PDU: u16 = 26;
    pub const IMSI: u16 = 40;
}

impl S1apMessage {
    pub fn find(&self, id: u16) -> Option<&ProtocolIe> {
        self.ies.iter().find(|ie| ie.id == id)
    }

    pub fn mme_ue_s1ap_id(&self) -> Option<u32> {
        self.find(ie_id::MME_UE_S1AP_ID).and_then(|ie| ie.value.get(..4)).map(|b| {
            u32::from_be_bytes(b.try_into().unwrap_or_default())
        })
    }

    pub fn enb_ue_s1ap_id(&self) -> Option<u32> {
        self.find(ie_id::ENB_UE_S1AP_ID).and_then(|ie| ie.value.get(..4)).map(|b| {
            u32::from_be_bytes(b.try_into().unwrap_or_default())
        })
    }

    pub fn nas_pdu(&self) -> Option<&[u8]> {
        self.find(ie_id::NAS_PDU).map(|ie| ie.value.as_slice())
    }

    pub fn imsi(&self) -> Option<String> {
        self.find(ie_id::IMSI).map(|ie| crate::decode::tbcd::decode(&ie.value))
    }
}

/// Constructs a neutral record from protocol IEs already extracted by an
/// external PER decoder (the black box this crate's scope excludes).
pub fn from_protocol_ies(procedure_code: u8, ies: Vec<ProtocolIe>) -> S1apMessage {
    S1apMessage { procedure_code, ies }
}
