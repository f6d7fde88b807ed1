// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Subscriber Context Store: the multi-identifier index over everything
//! known about one subscriber, reader-writer locked (spec §4.I / §5):
//! concurrent `find_by_*` calls proceed in parallel, mutators serialise.

use std::{
    collections::HashMap,
    net::IpAddr,
    sync::RwLock,
};

use crate::time::Timestamp;

pub type ContextId = u64;

const GUTI_HISTORY_LIMIT: usize = 8;

#[derive(Debug, Clone)]
pub struct LifecycleRecord {
    pub id: String,
    pub created: Timestamp,
    pub deleted: Option<Timestamp>,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriberContext {
    pub id: ContextId,
    pub imsi: Option<String>,
    pub supi: Option<String>,
    pub msisdn: Option<String>,
    pub imei: Option<String>,
    pub imeisv: Option<String>,
    pub guti: Option<String>,
    pub guti_history: Vec<String>,
    pub fiveg_guti: Option<String>,
    pub fiveg_guti_history: Vec<String>,
    pub ipv4: Vec<IpAddr>,
    pub ipv6: Vec<IpAddr>,
    pub current_ip: Option<IpAddr>,
    pub bearers: Vec<LifecycleRecord>,
    pub pdu_sessions: Vec<LifecycleRecord>,
    pub seids: Vec<u64>,
    pub mme_ue_s1ap_id: Option<u32>,
    pub enb_ue_s1ap_id: Option<u32>,
    pub amf_ue_ngap_id: Option<u64>,
    pub ran_ue_ngap_id: Option<u32>,
    pub sip_uris: Vec<String>,
    pub call_ids: Vec<String>,
    pub icids: Vec<String>,
    pub last_updated: Timestamp,
}

impl SubscriberContext {
    fn new(id: ContextId, now: Timestamp) -> SubscriberContext {
        SubscriberContext { id, last_updated: now, ..Default::default() }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub contexts_created: u64,
    pub contexts_evicted: u64,
    pub merges: u64,
}

#[derive(Default)]
struct Indices {
    imsi: HashMap<String, ContextId>,
    supi: HashMap<String, ContextId>,
    msisdn: HashMap<String, ContextId>,
    imei: HashMap<String, ContextId>,
    imeisv: HashMap<String, ContextId>,
    guti: HashMap<String, ContextId>,
    fiveg_guti: HashMap<String, ContextId>,
    ue_ip: HashMap<IpAddr, ContextId>,
    seid: HashMap<u64, ContextId>,
    call_id: HashMap<String, ContextId>,
    icid: HashMap<String, ContextId>,
}

struct StoreInner {
    contexts: HashMap<ContextId, SubscriberContext>,
    indices: Indices,
    next_id: ContextId,
    max_contexts: usize,
    stats: Stats,
}

pub struct SubscriberStore {
    inner: RwLock<StoreInner>,
}

impl SubscriberStore {
    pub fn new(max_contexts: usize) -> SubscriberStore {
        SubscriberStore {
            inner: RwLock::new(StoreInner {
                contexts: HashMap::new(),
                indices: Indices::default(),
                next_id: 1,
                max_contexts,
                stats: Stats::default(),
            }),
        }
    }

    pub fn stats(&self) -> Stats {
        self.inner.read().expect("subscriber store poisoned").stats
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("subscriber store poisoned").contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn find_by(&self, index: impl Fn(&Indices) -> Option<ContextId>) -> Option<SubscriberContext> {
        let guard = self.inner.read().expect("subscriber store poisoned");
        let id = index(&guard.indices)?;
        guard.contexts.get(&id).cloned()
    }

    pub fn find_by_imsi(&self, imsi: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.imsi.get(imsi).copied())
    }

    pub fn find_by_supi(&self, supi: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.supi.get(supi).copied())
    }

    pub fn find_by_msisdn(&self, msisdn: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.msisdn.get(msisdn).copied())
    }

    pub fn find_by_imei(&self, imei: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.imei.get(imei).copied())
    }

    pub fn find_by_imeisv(&self, imeisv: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.imeisv.get(imeisv).copied())
    }

    pub fn find_by_ue_ip(&self, ip: IpAddr) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.ue_ip.get(&ip).copied())
    }

    pub fn find_by_seid(&self, seid: u64) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.seid.get(&seid).copied())
    }

    pub fn find_by_call_id(&self, call_id: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.call_id.get(call_id).copied())
    }

    pub fn find_by_icid(&self, icid: &str) -> Option<SubscriberContext> {
        self.find_by(|idx| idx.icid.get(icid).copied())
    }

    pub fn find_by_id(&self, id: ContextId) -> Option<SubscriberContext> {
        self.inner.read().expect("subscriber store poisoned").contexts.get(&id).cloned()
    }

    /// Creates a new context if no context is indexed under `imsi`, else
    /// returns the existing one's id.
    pub fn get_or_create_by_imsi(&self, imsi: &str, now: Timestamp) -> ContextId {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(&id) = guard.indices.imsi.get(imsi) {
            return id;
        }
        let id = new_context(&mut guard, now);
        guard.indices.imsi.insert(imsi.to_string(), id);
        guard.contexts.get_mut(&id).expect("just inserted").imsi = Some(imsi.to_string());
        enforce_capacity(&mut guard);
        id
    }

    pub fn get_or_create_by_supi(&self, supi: &str, now: Timestamp) -> ContextId {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(&id) = guard.indices.supi.get(supi) {
            return id;
        }
        let id = new_context(&mut guard, now);
        guard.indices.supi.insert(supi.to_string(), id);
        guard.contexts.get_mut(&id).expect("just inserted").supi = Some(supi.to_string());
        enforce_capacity(&mut guard);
        id
    }

    /// Produces a context with only a synthetic id, to be linked to real
    /// identifiers later via `update_*`.
    pub fn create_temporary(&self, now: Timestamp) -> ContextId {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        let id = new_context(&mut guard, now);
        enforce_capacity(&mut guard);
        id
    }

    fn touch(guard: &mut StoreInner, id: ContextId, now: Timestamp) {
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.last_updated = now;
        }
    }

    pub fn update_msisdn(&self, id: ContextId, msisdn: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(old) = guard.contexts.get(&id).and_then(|c| c.msisdn.clone()) {
            guard.indices.msisdn.remove(&old);
        }
        guard.indices.msisdn.insert(msisdn.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.msisdn = Some(msisdn.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_imei(&self, id: ContextId, imei: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(old) = guard.contexts.get(&id).and_then(|c| c.imei.clone()) {
            guard.indices.imei.remove(&old);
        }
        guard.indices.imei.insert(imei.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.imei = Some(imei.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_imeisv(&self, id: ContextId, imeisv: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(old) = guard.contexts.get(&id).and_then(|c| c.imeisv.clone()) {
            guard.indices.imeisv.remove(&old);
        }
        guard.indices.imeisv.insert(imeisv.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.imeisv = Some(imeisv.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    /// GUTI update with bounded history: the prior value is appended before
    /// being replaced.
    pub fn update_guti(&self, id: ContextId, guti: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(old) = guard.contexts.get(&id).and_then(|c| c.guti.clone()) {
            guard.indices.guti.remove(&old);
            if let Some(ctx) = guard.contexts.get_mut(&id) {
                ctx.guti_history.push(old);
                if ctx.guti_history.len() > GUTI_HISTORY_LIMIT {
                    ctx.guti_history.remove(0);
                }
            }
        }
        guard.indices.guti.insert(guti.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.guti = Some(guti.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_fiveg_guti(&self, id: ContextId, guti: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(old) = guard.contexts.get(&id).and_then(|c| c.fiveg_guti.clone()) {
            guard.indices.fiveg_guti.remove(&old);
            if let Some(ctx) = guard.contexts.get_mut(&id) {
                ctx.fiveg_guti_history.push(old);
                if ctx.fiveg_guti_history.len() > GUTI_HISTORY_LIMIT {
                    ctx.fiveg_guti_history.remove(0);
                }
            }
        }
        guard.indices.fiveg_guti.insert(guti.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.fiveg_guti = Some(guti.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_ue_ip(&self, id: ContextId, ip: IpAddr, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        guard.indices.ue_ip.insert(ip, id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            let set = match ip {
                IpAddr::V4(_) => &mut ctx.ipv4,
                IpAddr::V6(_) => &mut ctx.ipv6,
            };
            if !set.contains(&ip) {
                set.push(ip);
            }
            ctx.current_ip = Some(ip);
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_call_id(&self, id: ContextId, call_id: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        guard.indices.call_id.insert(call_id.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id)
            && !ctx.call_ids.contains(&call_id.to_string())
        {
            ctx.call_ids.push(call_id.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_icid(&self, id: ContextId, icid: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        guard.indices.icid.insert(icid.to_string(), id);
        if let Some(ctx) = guard.contexts.get_mut(&id)
            && !ctx.icids.contains(&icid.to_string())
        {
            ctx.icids.push(icid.to_string());
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn update_control_plane_ids(
        &self,
        id: ContextId,
        mme_ue_s1ap_id: Option<u32>,
        enb_ue_s1ap_id: Option<u32>,
        now: Timestamp,
    ) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            if mme_ue_s1ap_id.is_some() {
                ctx.mme_ue_s1ap_id = mme_ue_s1ap_id;
            }
            if enb_ue_s1ap_id.is_some() {
                ctx.enb_ue_s1ap_id = enb_ue_s1ap_id;
            }
        }
        Self::touch(&mut guard, id, now);
    }

    /// 5G NGAP counterpart of `update_control_plane_ids`.
    pub fn update_ngap_ids(
        &self,
        id: ContextId,
        amf_ue_ngap_id: Option<u64>,
        ran_ue_ngap_id: Option<u32>,
        now: Timestamp,
    ) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            if amf_ue_ngap_id.is_some() {
                ctx.amf_ue_ngap_id = amf_ue_ngap_id;
            }
            if ran_ue_ngap_id.is_some() {
                ctx.ran_ue_ngap_id = ran_ue_ngap_id;
            }
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn add_bearer(&self, id: ContextId, bearer_id: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.bearers.push(LifecycleRecord { id: bearer_id.to_string(), created: now, deleted: None });
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn remove_bearer(&self, id: ContextId, bearer_id: &str, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(ctx) = guard.contexts.get_mut(&id)
            && let Some(rec) = ctx.bearers.iter_mut().find(|b| b.id == bearer_id)
        {
            rec.deleted = Some(now);
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn add_pdu_session(&self, id: ContextId, seid: u64, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        guard.indices.seid.insert(seid, id);
        if let Some(ctx) = guard.contexts.get_mut(&id) {
            ctx.seids.push(seid);
            ctx.pdu_sessions.push(LifecycleRecord { id: seid.to_string(), created: now, deleted: None });
        }
        Self::touch(&mut guard, id, now);
    }

    pub fn remove_pdu_session(&self, id: ContextId, seid: u64, now: Timestamp) {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        if let Some(ctx) = guard.contexts.get_mut(&id)
            && let Some(rec) = ctx.pdu_sessions.iter_mut().find(|p| p.id == seid.to_string())
        {
            rec.deleted = Some(now);
        }
        Self::touch(&mut guard, id, now);
    }

    /// Unifies two contexts: every identifier and child record of `drop_id`
    /// moves into `keep_id`, every index entry pointing at `drop_id` is
    /// repointed, and `drop_id` is erased. Atomic under the write lock.
    pub fn merge(&self, keep_id: ContextId, drop_id: ContextId) {
        if keep_id == drop_id {
            return;
        }
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        let Some(drop_ctx) = guard.contexts.remove(&drop_id) else { return };

        reindex_opt(&mut guard.indices.imsi, &drop_ctx.imsi, keep_id);
        reindex_opt(&mut guard.indices.supi, &drop_ctx.supi, keep_id);
        reindex_opt(&mut guard.indices.msisdn, &drop_ctx.msisdn, keep_id);
        reindex_opt(&mut guard.indices.imei, &drop_ctx.imei, keep_id);
        reindex_opt(&mut guard.indices.imeisv, &drop_ctx.imeisv, keep_id);
        reindex_opt(&mut guard.indices.guti, &drop_ctx.guti, keep_id);
        reindex_opt(&mut guard.indices.fiveg_guti, &drop_ctx.fiveg_guti, keep_id);
        for ip in drop_ctx.ipv4.iter().chain(drop_ctx.ipv6.iter()) {
            guard.indices.ue_ip.insert(*ip, keep_id);
        }
        for seid in &drop_ctx.seids {
            guard.indices.seid.insert(*seid, keep_id);
        }
        for cid in &drop_ctx.call_ids {
            guard.indices.call_id.insert(cid.clone(), keep_id);
        }
        for icid in &drop_ctx.icids {
            guard.indices.icid.insert(icid.clone(), keep_id);
        }

        if let Some(keep) = guard.contexts.get_mut(&keep_id) {
            keep.imsi = keep.imsi.clone().or(drop_ctx.imsi);
            keep.supi = keep.supi.clone().or(drop_ctx.supi);
            keep.msisdn = keep.msisdn.clone().or(drop_ctx.msisdn);
            keep.imei = keep.imei.clone().or(drop_ctx.imei);
            keep.imeisv = keep.imeisv.clone().or(drop_ctx.imeisv);
            keep.guti = keep.guti.clone().or(drop_ctx.guti);
            keep.fiveg_guti = keep.fiveg_guti.clone().or(drop_ctx.fiveg_guti);
            for ip in drop_ctx.ipv4 {
                if !keep.ipv4.contains(&ip) {
                    keep.ipv4.push(ip);
                }
            }
            for ip in drop_ctx.ipv6 {
                if !keep.ipv6.contains(&ip) {
                    keep.ipv6.push(ip);
                }
            }
            keep.current_ip = keep.current_ip.or(drop_ctx.current_ip);
            keep.bearers.extend(drop_ctx.bearers);
            keep.pdu_sessions.extend(drop_ctx.pdu_sessions);
            keep.seids.extend(drop_ctx.seids);
            keep.mme_ue_s1ap_id = keep.mme_ue_s1ap_id.or(drop_ctx.mme_ue_s1ap_id);
            keep.enb_ue_s1ap_id = keep.enb_ue_s1ap_id.or(drop_ctx.enb_ue_s1ap_id);
            keep.amf_ue_ngap_id = keep.amf_ue_ngap_id.or(drop_ctx.amf_ue_ngap_id);
            keep.ran_ue_ngap_id = keep.ran_ue_ngap_id.or(drop_ctx.ran_ue_ngap_id);
            for uri in drop_ctx.sip_uris {
                if !keep.sip_uris.contains(&uri) {
                    keep.sip_uris.push(uri);
                }
            }
            keep.call_ids.extend(drop_ctx.call_ids);
            keep.icids.extend(drop_ctx.icids);
        }
        guard.stats.merges += 1;
    }

    /// Removes every context whose `last_updated` precedes `cutoff`,
    /// including all its index entries. Returns the count removed.
    pub fn cleanup_stale(&self, cutoff: Timestamp) -> usize {
        let mut guard = self.inner.write().expect("subscriber store poisoned");
        let stale: Vec<ContextId> =
            guard.contexts.iter().filter(|(_, c)| c.last_updated.0 < cutoff.0).map(|(id, _)| *id).collect();
        for id in &stale {
            remove_context_and_indices(&mut guard, *id);
        }
        stale.len()
    }
}

fn reindex_opt(index: &mut HashMap<String, ContextId>, value: &Option<String>, keep_id: ContextId) {
    if let Some(v) = value {
        index.insert(v.clone(), keep_id);
    }
}

fn new_context(guard: &mut StoreInner, now: Timestamp) -> ContextId {
    let id = guard.next_id;
    guard.next_id += 1;
    guard.contexts.insert(id, SubscriberContext::new(id, now));
    guard.stats.contexts_created += 1;
    id
}

fn remove_context_and_indices(guard: &mut StoreInner, id: ContextId) {
    let Some(ctx) = guard.contexts.remove(&id) else { return };
    if let Some(v) = &ctx.imsi {
        guard.indices.imsi.remove(v);
    }
    if let Some(v) = &ctx.supi {
        guard.indices.supi.remove(v);
    }
    if let Some(v) = &ctx.msisdn {
        guard.indices.msisdn.remove(v);
    }
    if let Some(v) = &ctx.imei {
        guard.indices.imei.remove(v);
    }
    if let Some(v) = &ctx.imeisv {
        guard.indices.imeisv.remove(v);
    }
    if let Some(v) = &ctx.guti {
        guard.indices.guti.remove(v);
    }
    if let Some(v) = &ctx.fiveg_guti {
        guard.indices.fiveg_guti.remove(v);
    }
    for ip in ctx.ipv4.iter().chain(ctx.ipv6.iter()) {
        guard.indices.ue_ip.remove(ip);
    }
    for seid in &ctx.seids {
        guard.indices.seid.remove(seid);
    }
    for cid in &ctx.call_ids {
        guard.indices.call_id.remove(cid);
    }
    for icid in &ctx.icids {
        guard.indices.icid.remove(icid);
    }
}

/// Evicts the least-recently-updated context when `size() > max_contexts`.
fn enforce_capacity(guard: &mut StoreInner) {
    if guard.contexts.len() <= guard.max_contexts {
        return;
    }
    if let Some((&oldest, _)) = guard.contexts.iter().min_by_key(|(_, c)| c.last_updated.0) {
        remove_context_and_indices(guard, oldest);
        guard.stats.contexts_evicted += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn merge_unifies_identifiers_and_removes_drop() {
        let store = SubscriberStore::new(1_000);
        let now = Timestamp(0);
        let a = store.get_or_create_by_imsi("imsi-x", now);
        store.update_ue_ip(a, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), now);
        let b = store.create_temporary(now);
        store.update_msisdn(b, "msisdn-y", now);
        store.update_ue_ip(b, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), now);

        store.merge(a, b);

        assert_eq!(store.find_by_msisdn("msisdn-y").map(|c| c.id), Some(a));
        assert_eq!(store.find_by_ue_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))).map(|c| c.id), Some(a));
        assert_eq!(store.find_by_ue_ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))).map(|c| c.id), Some(a));
        assert!(store.find_by_id(b).is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_updated() {
        let store = SubscriberStore::new(1);
        let a = store.get_or_create_by_imsi("imsi-a", Timestamp(0));
        let _b = store.get_or_create_by_imsi("imsi-b", Timestamp(100));
        assert!(store.find_by_id(a).is_none());
        assert_eq!(store.stats().contexts_evicted, 1);
    }

    #[test]
    fn guti_update_preserves_history() {
        let store = SubscriberStore::new(1_000);
        let id = store.create_temporary(Timestamp(0));
        store.update_guti(id, "guti-1", Timestamp(1));
        store.update_guti(id, "guti-2", Timestamp(2));
        let ctx = store.find_by_id(id).unwrap();
        assert_eq!(ctx.guti.as_deref(), Some("guti-2"));
        assert_eq!(ctx.guti_history, vec!["guti-1".to_string()]);
    }
}
