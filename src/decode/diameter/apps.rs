// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Application-aware identity and field extraction over a decoded
//! `DiameterMessage`, grounded on `protocol_parsers/diameter_s6a.h` for the
//! S6a subset and on spec §4.H for the cross-application rules (IMSI from
//! User-Name or Subscription-Id, MSISDN from Subscription-Id, Framed-IP from
//! Framed-IP-Address/Framed-IPv6-Prefix, APN from Called-Station-Id, and the
//! per-interface charging/QoS fields).

use super::{Avp, DiameterMessage};

pub const AVP_USER_NAME: u32 = 1;
pub const AVP_FRAMED_IP_ADDRESS: u32 = 8;
pub const AVP_CALLED_STATION_ID: u32 = 30;
pub const AVP_FRAMED_IPV6_PREFIX: u32 = 97;
pub const AVP_SUBSCRIPTION_ID: u32 = 443;
pub const AVP_SUBSCRIPTION_ID_TYPE: u32 = 450;
pub const AVP_SUBSCRIPTION_ID_DATA: u32 = 444;
pub const AVP_RAT_TYPE: u32 = 1032;
pub const AVP_PUBLIC_IDENTITY: u32 = 601;
pub const AVP_AF_APPLICATION_IDENTIFIER: u32 = 504;
pub const AVP_MEDIA_TYPE: u32 = 520;
pub const AVP_MEDIA_COMPONENT_DESCRIPTION: u32 = 517;
pub const AVP_CC_REQUEST_TYPE: u32 = 416;
pub const AVP_CC_REQUEST_NUMBER: u32 = 415;
pub const AVP_CHARGING_RULE_INSTALL: u32 = 1001;
pub const AVP_CHARGING_RULE_NAME: u32 = 1005;
pub const AVP_QOS_INFORMATION: u32 = 1016;
pub const AVP_QCI: u32 = 1028;

/// RFC 4006 §8.47 Subscription-Id-Type enumerants.
pub const SUBSCRIPTION_ID_TYPE_E164: u32 = 0;
pub const SUBSCRIPTION_ID_TYPE_IMSI: u32 = 1;

fn subscription_id(avps: &[Avp], kind: u32) -> Option<String> {
    Avp::find_all(avps, AVP_SUBSCRIPTION_ID).into_iter().find_map(|sub| {
        let children = sub.grouped();
        let ty = Avp::find(&children, AVP_SUBSCRIPTION_ID_TYPE)?.as_u32()?;
        if ty != kind {
            return None;
        }
        Avp::find(&children, AVP_SUBSCRIPTION_ID_DATA)?.as_str().map(str::to_string)
    })
}

pub fn imsi(msg: &DiameterMessage) -> Option<String> {
    subscription_id(&msg.avps, SUBSCRIPTION_ID_TYPE_IMSI)
        .or_else(|| Avp::find(&msg.avps, AVP_USER_NAME).and_then(|a| a.as_str()).map(str::to_string))
}

pub fn msisdn(msg: &DiameterMessage) -> Option<String> {
    subscription_id(&msg.avps, SUBSCRIPTION_ID_TYPE_E164)
}

pub fn framed_ip(msg: &DiameterMessage) -> Option<std::net::IpAddr> {
    Avp::find(&msg.avps, AVP_FRAMED_IP_ADDRESS)
        .and_then(|a| a.as_address())
        .or_else(|| Avp::find(&msg.avps, AVP_FRAMED_IPV6_PREFIX).and_then(|a| a.as_ipv6_prefix()))
}

pub fn apn(msg: &DiameterMessage) -> Option<String> {
    Avp::find(&msg.avps, AVP_CALLED_STATION_ID).and_then(|a| a.as_str()).map(str::to_string)
}

pub fn rat_type(msg: &DiameterMessage) -> Option<u32> {
    Avp::find(&msg.avps, AVP_RAT_TYPE).and_then(|a| a.as_u32())
}

/// Cx/Sh: the asserted IMS public identity.
pub fn public_identity(msg: &DiameterMessage) -> Option<String> {
    Avp::find(&msg.avps, AVP_PUBLIC_IDENTITY).and_then(|a| a.as_str()).map(str::to_string)
}

/// Rx: AF-Application-Identifier and Media-Type per Media-Component-Description.
pub fn rx_media_components(msg: &DiameterMessage) -> Vec<(Option<String>, Option<u32>)> {
    Avp::find_all(&msg.avps, AVP_MEDIA_COMPONENT_DESCRIPTION)
        .into_iter()
        .map(|mcd| {
            let children = mcd.grouped();
            let af_app = Avp::find(&children, AVP_AF_APPLICATION_IDENTIFIER).and_then(|a| a.as_str()).map(str::to_string);
            let media_type = Avp::find(&children, AVP_MEDIA_TYPE).and_then(|a| a.as_u32());
            (af_app, media_type)
        })
        .collect()
}

/// Gx/Gy: CC-Request-Type / CC-Request-Number.
pub fn cc_request(msg: &DiameterMessage) -> Option<(u32, u32)> {
    let ty = Avp::find(&msg.avps, AVP_CC_REQUEST_TYPE)?.as_u32()?;
    let num = Avp::find(&msg.avps, AVP_CC_REQUEST_NUMBER)?.as_u32()?;
    Some((ty, num))
}

/// Gx: Charging-Rule-Name list inside each Charging-Rule-Install.
pub fn gx_charging_rule_names(msg: &DiameterMessage) -> Vec<String> {
    Avp::find_all(&msg.avps, AVP_CHARGING_RULE_INSTALL)
        .into_iter()
        .flat_map(|install| {
            let children = install.grouped();
            Avp::find_all(&children, AVP_CHARGING_RULE_NAME)
                .into_iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Gx: QCI inside QoS-Information.
pub fn gx_qci(msg: &DiameterMessage) -> Option<u32> {
    let qos = Avp::find(&msg.avps, AVP_QOS_INFORMATION)?;
    Avp::find(&qos.grouped(), AVP_QCI)?.as_u32()
}

/// Interface detected from the Application-Id on the session's first
/// message (spec §4.H). Named the way the correlator names `Interface`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interface {
    Base,
    Cx,
    Sh,
    S6a,
    Gx,
    Rx,
    Gy,
    Ro,
    Swx,
    S6b,
    Slg,
    Unknown,
}

pub fn interface_from_application_id(app_id: u32) -> Interface {
    match app_id {
        0 => Interface::Base,
        4 => Interface::Gy,
        16777216 => Interface::Cx,
        16777217 => Interface::Sh,
        16777236 => Interface::Rx,
        16777238 => Interface::Gx,
        16777251 => Interface::S6a,
        _ => Interface::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_application_ids() {
        assert_eq!(interface_from_application_id(16777251), Interface::S6a);
        assert_eq!(interface_from_application_id(16777238), Interface::Gx);
        assert_eq!(interface_from_application_id(16777236), Interface::Rx);
        assert_eq!(interface_from_application_id(4), Interface::Gy);
        assert_eq!(interface_from_application_id(9999), Interface::Unknown);
    }
}
