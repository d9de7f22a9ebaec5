//! Decides when influence is recomputed and broadcast, applies what peers
//! send, and serves the snapshot handshake for late joiners.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use influence_proto::{ClientId, IdentityKey, InfluenceRecord, SyncEnvelope, SyncMessage};

use crate::aggregator::{InfluenceAggregator, SceneContribution};
use crate::auditor::{AuditReport, ConsistencyAuditor};
use crate::cache::{CacheChange, InfluenceCache};
use crate::calculator::{InfluenceCalculator, InfluenceScore};
use crate::channel::ReplicationChannel;
use crate::identity::{IdentityResolver, KeyShape};
use crate::metrics::SyncMetrics;
use crate::pacing::BroadcastPacer;
use crate::sync_config::SyncConfig;
use crate::world::{CharacterSheet, TokenRef, WorldView};

/// Whether this client derives truth from the world (the GM) or follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Authority,
    Player,
}

/// A tag or status belonging to an NPC changed a relevant field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub character_id: String,
    /// Set when the edit happened through a token (unlinked tokens own their
    /// sheet).
    pub token_id: Option<String>,
}

impl ItemChange {
    pub fn character(character_id: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            token_id: None,
        }
    }

    pub fn token(character_id: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            character_id: character_id.into(),
            token_id: Some(token_id.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Created,
    Updated,
    Unchanged,
    Removed,
    /// Referent missing or not an NPC.
    Skipped,
}

impl RefreshOutcome {
    pub fn is_change(self) -> bool {
        matches!(
            self,
            RefreshOutcome::Created | RefreshOutcome::Updated | RefreshOutcome::Removed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncMode {
    /// Broadcast only identities whose value changed.
    ChangedOnly,
    /// Broadcast every cached identity.
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub visible: usize,
    pub changed: usize,
    pub removed: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub entries: usize,
    pub audit: Option<AuditReport>,
    pub resync: ResyncSummary,
    pub snapshot_requested: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub received: usize,
    pub sent: usize,
    pub scene_pass: bool,
}

/// One per client process. Owns that client's replica of the cache.
pub struct SyncCoordinator<C> {
    client_id: ClientId,
    role: ClientRole,
    config: Arc<SyncConfig>,
    resolver: IdentityResolver,
    calculator: InfluenceCalculator,
    auditor: ConsistencyAuditor,
    aggregator: InfluenceAggregator,
    cache: InfluenceCache,
    channel: C,
    pacer: BroadcastPacer,
    scene_pass_due: Option<Instant>,
    awaiting_snapshot: bool,
    next_seq: u64,
    queued_total: usize,
    metrics: SyncMetrics,
}

impl<C: ReplicationChannel> SyncCoordinator<C> {
    pub fn new(role: ClientRole, channel: C, config: Arc<SyncConfig>) -> Self {
        let resolver = IdentityResolver::new();
        let calculator = InfluenceCalculator::new();
        Self {
            client_id: channel.local_id().clone(),
            role,
            pacer: BroadcastPacer::new(config.broadcast_spacing()),
            config,
            resolver,
            calculator,
            auditor: ConsistencyAuditor::new(resolver, calculator),
            aggregator: InfluenceAggregator::new(resolver),
            cache: InfluenceCache::new(),
            channel,
            scene_pass_due: None,
            awaiting_snapshot: false,
            next_seq: 0,
            queued_total: 0,
            metrics: SyncMetrics::default(),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn role(&self) -> ClientRole {
        self.role
    }

    pub fn is_authority(&self) -> bool {
        self.role == ClientRole::Authority
    }

    pub fn cache(&self) -> &InfluenceCache {
        &self.cache
    }

    pub fn metrics(&self) -> &SyncMetrics {
        &self.metrics
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.pacer.len()
    }

    pub fn awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    /// Earliest instant at which [`pump`](Self::pump) has scheduled work.
    pub fn next_wakeup(&self) -> Option<Instant> {
        match (self.scene_pass_due, self.pacer.next_release()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Called once the client is connected to the session.
    pub fn on_session_joined(&mut self) {
        if !self.is_authority() {
            self.request_snapshot();
        }
    }

    /// Local-state-changed path: recompute one identity and broadcast the
    /// result if it differs from the cache.
    pub fn on_item_changed(&mut self, world: &dyn WorldView, change: &ItemChange) -> RefreshOutcome {
        let (token, sheet) = match change.token_id.as_deref() {
            Some(token_id) => match world.scene_token(token_id) {
                Some(scene_token) => (Some(scene_token.token), scene_token.sheet),
                None => {
                    tracing::debug!(
                        target: "influence_sync::coordinator",
                        token = token_id,
                        "item_change.skipped=missing_token"
                    );
                    return RefreshOutcome::Skipped;
                }
            },
            None => match world.character(&change.character_id) {
                Some(sheet) => (None, sheet),
                None => {
                    tracing::debug!(
                        target: "influence_sync::coordinator",
                        character = %change.character_id,
                        "item_change.skipped=missing_character"
                    );
                    return RefreshOutcome::Skipped;
                }
            },
        };
        if !sheet.kind.is_npc_like() {
            return RefreshOutcome::Skipped;
        }
        self.refresh_identity(token.as_ref(), &sheet, true, false)
    }

    pub fn on_token_created(&mut self, world: &dyn WorldView, token_id: &str) -> RefreshOutcome {
        match world.scene_token(token_id) {
            Some(scene_token) if scene_token.sheet.kind.is_npc_like() => {
                self.refresh_identity(Some(&scene_token.token), &scene_token.sheet, true, false)
            }
            Some(_) => RefreshOutcome::Skipped,
            None => {
                tracing::debug!(
                    target: "influence_sync::coordinator",
                    token = token_id,
                    "token_created.skipped=missing_token"
                );
                RefreshOutcome::Skipped
            }
        }
    }

    /// Unlinked tokens take their record with them. Linked tokens leave the
    /// character's record in place.
    pub fn on_token_deleted(&mut self, token: &TokenRef) -> bool {
        if token.actor_linked {
            return false;
        }
        let key = self.resolver.resolve(Some(token), &token.character_id);
        let removed = self.cache.remove(key.as_str()).is_some();
        if removed && self.is_authority() {
            self.queue(SyncMessage::InfluenceDelete { identity_key: key });
        }
        removed
    }

    /// Purges every record belonging to the character.
    pub fn on_character_deleted(&mut self, character_id: &str) -> Vec<IdentityKey> {
        let mut keys = self.cache.keys_for_npc(character_id);
        let character_key = self.resolver.resolve(None, character_id);
        if self.cache.contains(character_key.as_str()) && !keys.contains(&character_key) {
            keys.push(character_key);
        }
        for key in &keys {
            self.cache.remove(key.as_str());
            if self.is_authority() {
                self.queue(SyncMessage::InfluenceDelete {
                    identity_key: key.clone(),
                });
            }
        }
        tracing::debug!(
            target: "influence_sync::coordinator",
            character = character_id,
            purged = keys.len(),
            "character_deleted.purged"
        );
        keys
    }

    /// Scene finished loading; the scene pass runs after the settle delay.
    pub fn on_scene_ready(&mut self, now: Instant) {
        self.scene_pass_due = Some(now + self.config.settle_delay());
    }

    /// One cooperative step: apply inbound messages, run a due scene pass,
    /// send whatever the pacer releases.
    pub fn pump(&mut self, world: &dyn WorldView, now: Instant) -> PumpReport {
        let mut report = PumpReport::default();
        loop {
            match self.channel.try_recv() {
                Ok(Some(envelope)) => {
                    report.received += 1;
                    self.handle_envelope(envelope);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(
                        target: "influence_sync::coordinator",
                        client = %self.client_id,
                        error = %err,
                        "channel.recv_failed"
                    );
                    break;
                }
            }
        }

        if matches!(self.scene_pass_due, Some(due) if now >= due) {
            self.scene_pass_due = None;
            self.run_scene_pass(world);
            report.scene_pass = true;
        }

        report.sent = self.flush(now);
        report
    }

    pub fn handle_envelope(&mut self, envelope: SyncEnvelope) {
        if envelope.sender == self.client_id {
            return;
        }
        self.metrics.messages_received += 1;
        tracing::trace!(
            target: "influence_sync::coordinator",
            client = %self.client_id,
            sender = %envelope.sender,
            seq = envelope.seq,
            kind = envelope.message.kind(),
            "message.received"
        );
        match envelope.message {
            SyncMessage::InfluenceUpdate {
                identity_key,
                record,
            } => self.apply_update(identity_key, record),
            SyncMessage::InfluenceDelete { identity_key } => self.apply_delete(&identity_key),
            SyncMessage::RequestSnapshot { requester_id } => self.serve_snapshot(requester_id),
            SyncMessage::BulkSnapshot {
                requester_id,
                records,
            } => self.apply_snapshot(&requester_id, records, &envelope.sender),
            SyncMessage::RefreshSignal => {
                if !self.is_authority() {
                    self.request_snapshot();
                }
            }
        }
    }

    /// Asks the authority for its full cache. No-op on the authority.
    pub fn request_snapshot(&mut self) -> bool {
        if self.is_authority() {
            return false;
        }
        self.awaiting_snapshot = true;
        self.queue(SyncMessage::RequestSnapshot {
            requester_id: self.client_id.clone(),
        });
        true
    }

    /// Recomputes every visible NPC. The authority also purges unreachable
    /// entries, broadcasts the outcome and finishes with a refresh signal.
    /// Players only refresh their local replica.
    pub fn full_resync(
        &mut self,
        world: &dyn WorldView,
        mode: ResyncMode,
        forced: &HashSet<IdentityKey>,
    ) -> ResyncSummary {
        let publish = self.is_authority();
        let queued_before = self.queued_total;
        let mut summary = ResyncSummary::default();
        let mut seen: HashSet<IdentityKey> = HashSet::new();

        for scene_token in world.scene_tokens() {
            let key = self
                .resolver
                .resolve(Some(&scene_token.token), &scene_token.sheet.id);
            if !seen.insert(key.clone()) {
                continue;
            }
            let force = mode == ResyncMode::Full || forced.contains(&key);
            let outcome =
                self.refresh_identity(Some(&scene_token.token), &scene_token.sheet, publish, force);
            if outcome.is_change() {
                summary.changed += 1;
            }
        }
        summary.visible = seen.len();

        let off_scene: Vec<InfluenceRecord> = self
            .cache
            .records_sorted()
            .into_iter()
            .filter(|record| !seen.contains(&record.identity_key))
            .collect();
        for record in off_scene {
            if forced.contains(&record.identity_key)
                && self.resolver.key_shape(&record) == KeyShape::Character
            {
                if let Some(sheet) = world.character(&record.npc_id) {
                    if self.refresh_identity(None, &sheet, publish, true).is_change() {
                        summary.changed += 1;
                    }
                    continue;
                }
            }
            if publish && mode == ResyncMode::Full {
                self.queue(SyncMessage::InfluenceUpdate {
                    identity_key: record.identity_key.clone(),
                    record,
                });
            }
        }

        if publish {
            for key in self.auditor.find_stale(&self.cache, world) {
                self.cache.remove(key.as_str());
                self.queue(SyncMessage::InfluenceDelete { identity_key: key });
                summary.removed += 1;
            }
            self.queue(SyncMessage::RefreshSignal);
        }

        summary.queued = self.queued_total - queued_before;
        tracing::info!(
            target: "influence_sync::coordinator",
            client = %self.client_id,
            visible = summary.visible,
            changed = summary.changed,
            removed = summary.removed,
            queued = summary.queued,
            entries = self.cache.len(),
            "resync.completed"
        );
        summary
    }

    /// Audit followed by a full resync. Authority only.
    pub fn run_audit(&mut self, world: &dyn WorldView) -> Option<AuditReport> {
        self.audit_and_resync(world).map(|(report, _)| report)
    }

    /// Operator-triggered synchronization.
    pub fn manual_sync(&mut self, world: &dyn WorldView, now: Instant) -> SyncSummary {
        let mut summary = SyncSummary::default();
        if let Some((report, resync)) = self.audit_and_resync(world) {
            summary.audit = Some(report);
            summary.resync = resync;
        } else {
            summary.resync = self.full_resync(world, ResyncMode::ChangedOnly, &HashSet::new());
            summary.snapshot_requested = self.request_snapshot();
        }
        self.flush(now);
        summary.entries = self.cache.len();

        tracing::info!(
            target: "influence_sync::coordinator",
            client = %self.client_id,
            entries = summary.entries,
            "synchronized {} entries",
            summary.entries
        );
        self.metrics.log_summary(self.client_id.as_str());
        summary
    }

    /// Influence total of the active scene, counting each identity once.
    pub fn scene_total(&self, world: &dyn WorldView) -> i64 {
        let scene = world.scene_tokens();
        self.aggregator
            .total_for_scene(&self.cache, scene.iter().map(|scene_token| &scene_token.token))
    }

    pub fn scene_contributions(&self, world: &dyn WorldView) -> Vec<SceneContribution> {
        let scene = world.scene_tokens();
        self.aggregator
            .contributions(&self.cache, scene.iter().map(|scene_token| &scene_token.token))
    }

    /// Sends everything the pacer releases at `now`. Failures are counted and
    /// logged; nothing is retried.
    pub fn flush(&mut self, now: Instant) -> usize {
        let mut sent = 0;
        for message in self.pacer.release_due(now) {
            let kind = message.kind();
            let envelope = SyncEnvelope::new(self.client_id.clone(), self.next_seq, message);
            self.next_seq += 1;
            match self.channel.broadcast(&envelope) {
                Ok(()) => {
                    sent += 1;
                    self.metrics.messages_sent += 1;
                    tracing::trace!(
                        target: "influence_sync::coordinator",
                        client = %self.client_id,
                        seq = envelope.seq,
                        kind,
                        "message.sent"
                    );
                }
                Err(err) => {
                    self.metrics.send_failures += 1;
                    tracing::warn!(
                        target: "influence_sync::coordinator",
                        client = %self.client_id,
                        kind,
                        error = %err,
                        "message.send_failed"
                    );
                }
            }
        }
        sent
    }

    fn run_scene_pass(&mut self, world: &dyn WorldView) {
        if self.is_authority() {
            if self.config.audit_on_scene_change {
                self.audit_and_resync(world);
            } else {
                self.full_resync(world, ResyncMode::Full, &HashSet::new());
            }
        } else {
            self.full_resync(world, ResyncMode::ChangedOnly, &HashSet::new());
            self.request_snapshot();
        }
    }

    fn audit_and_resync(&mut self, world: &dyn WorldView) -> Option<(AuditReport, ResyncSummary)> {
        if !self.is_authority() {
            tracing::debug!(
                target: "influence_sync::coordinator",
                client = %self.client_id,
                "audit.skipped=not_authority"
            );
            return None;
        }
        let report = self.auditor.audit(&mut self.cache, world);
        self.metrics.audits_run += 1;
        for key in report.removed_keys() {
            self.queue(SyncMessage::InfluenceDelete { identity_key: key });
        }
        let resync = self.full_resync(world, ResyncMode::Full, &report.drifted_keys());
        Some((report, resync))
    }

    fn refresh_identity(
        &mut self,
        token: Option<&TokenRef>,
        sheet: &CharacterSheet,
        publish: bool,
        force: bool,
    ) -> RefreshOutcome {
        let key = self.resolver.resolve(token, &sheet.id);
        let score = self.calculator.compute(sheet);

        if score.is_zero() {
            if self.cache.remove(key.as_str()).is_none() {
                return RefreshOutcome::Unchanged;
            }
            if publish {
                self.queue(SyncMessage::InfluenceDelete {
                    identity_key: key.clone(),
                });
            }
            tracing::debug!(
                target: "influence_sync::coordinator",
                client = %self.client_id,
                key = %key,
                "influence.removed=zero"
            );
            return RefreshOutcome::Removed;
        }

        let record = build_record(key.clone(), token, sheet, score);
        let outcome = match self.cache.get(key.as_str()) {
            Some(existing)
                if existing.same_influence(&record) && existing.npc_name == record.npc_name =>
            {
                RefreshOutcome::Unchanged
            }
            Some(_) => RefreshOutcome::Updated,
            None => RefreshOutcome::Created,
        };
        if outcome != RefreshOutcome::Unchanged {
            self.cache.upsert(record);
            tracing::debug!(
                target: "influence_sync::coordinator",
                client = %self.client_id,
                key = %key,
                tag = score.tag_influence,
                status = score.status_influence,
                total = score.total_influence,
                "influence.recomputed"
            );
            if tracing::enabled!(target: "influence_sync::coordinator", tracing::Level::DEBUG) {
                for part in self.calculator.breakdown(sheet) {
                    tracing::debug!(
                        target: "influence_sync::coordinator",
                        key = %key,
                        item = %part.item_id,
                        name = %part.item_name,
                        source = ?part.source,
                        value = part.value,
                        "influence.contribution"
                    );
                }
            }
        }

        if publish && (outcome != RefreshOutcome::Unchanged || force) {
            if let Some(stored) = self.cache.get(key.as_str()).cloned() {
                self.queue(SyncMessage::InfluenceUpdate {
                    identity_key: key,
                    record: stored,
                });
            }
        }
        outcome
    }

    fn apply_update(&mut self, identity_key: IdentityKey, mut record: InfluenceRecord) {
        if record.identity_key != identity_key {
            tracing::debug!(
                target: "influence_sync::coordinator",
                message_key = %identity_key,
                record_key = %record.identity_key,
                "update.key_mismatch=message_key_wins"
            );
            record.identity_key = identity_key;
        }
        match record.component_total() {
            None => {
                tracing::debug!(
                    target: "influence_sync::coordinator",
                    key = %record.identity_key,
                    tag = record.tag_influence,
                    status = record.status_influence,
                    "update.dropped=total_overflow"
                );
                return;
            }
            Some(total) if total != record.total_influence => tracing::debug!(
                target: "influence_sync::coordinator",
                key = %record.identity_key,
                "update.total_normalized"
            ),
            Some(_) => {}
        }
        match self.cache.upsert(record) {
            CacheChange::Inserted | CacheChange::Updated => self.metrics.updates_applied += 1,
            CacheChange::Removed => self.metrics.deletes_applied += 1,
            CacheChange::Unchanged | CacheChange::Rejected => {}
        }
    }

    fn apply_delete(&mut self, identity_key: &IdentityKey) {
        if self.cache.remove(identity_key.as_str()).is_some() {
            self.metrics.deletes_applied += 1;
        }
    }

    fn serve_snapshot(&mut self, requester_id: ClientId) {
        if !self.is_authority() {
            return;
        }
        let records = self.cache.records_sorted();
        tracing::info!(
            target: "influence_sync::coordinator",
            client = %self.client_id,
            requester = %requester_id,
            records = records.len(),
            "snapshot.served"
        );
        self.metrics.snapshots_served += 1;
        self.queue(SyncMessage::BulkSnapshot {
            requester_id,
            records,
        });
    }

    fn apply_snapshot(&mut self, requester_id: &ClientId, records: Vec<InfluenceRecord>, sender: &ClientId) {
        if requester_id != &self.client_id {
            return;
        }
        let received = records.len();
        let kept = self.cache.replace_all(records);
        self.awaiting_snapshot = false;
        self.metrics.snapshots_applied += 1;
        tracing::info!(
            target: "influence_sync::coordinator",
            client = %self.client_id,
            sender = %sender,
            received,
            kept,
            digest = self.cache.digest(),
            "snapshot.applied"
        );
    }

    fn queue(&mut self, message: SyncMessage) {
        self.queued_total += 1;
        self.pacer.enqueue(message);
    }
}

fn build_record(
    identity_key: IdentityKey,
    token: Option<&TokenRef>,
    sheet: &CharacterSheet,
    score: InfluenceScore,
) -> InfluenceRecord {
    InfluenceRecord {
        identity_key,
        npc_id: sheet.id.clone(),
        npc_name: sheet.name.clone(),
        token_id: token.map(|token| token.id.clone()),
        token_name: token.map(|token| token.name.clone()),
        actor_link: token.map(|token| token.actor_linked).unwrap_or(true),
        tag_influence: score.tag_influence,
        status_influence: score.status_influence,
        total_influence: score.total_influence,
        timestamp: timestamp_ms(),
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LocalBus, LocalEndpoint};
    use crate::world::{InMemoryWorld, TagState};

    fn world() -> InMemoryWorld {
        let mut world = InMemoryWorld::new();
        world.insert_character(
            CharacterSheet::npc("boss", "Boss").with_tag("fear", "Feared", TagState::Positive),
        );
        world.insert_character(CharacterSheet::npc("thug", "Thug"));
        world.place_token("lair", "tok-boss", "Boss", "boss", true);
        world.place_token("lair", "tok-thug", "Thug", "thug", false);
        world.activate_scene("lair");
        world
    }

    fn client(bus: &LocalBus, id: &str, role: ClientRole) -> SyncCoordinator<LocalEndpoint> {
        SyncCoordinator::new(
            role,
            bus.connect(ClientId::from(id)),
            Arc::new(SyncConfig::immediate()),
        )
    }

    #[test]
    fn local_change_reaches_peer() {
        let bus = LocalBus::new();
        let world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        let mut player = client(&bus, "p1", ClientRole::Player);
        let now = Instant::now();

        let outcome = gm.on_item_changed(&world, &ItemChange::token("boss", "tok-boss"));
        assert_eq!(outcome, RefreshOutcome::Created);
        assert_eq!(gm.pump(&world, now).sent, 1);

        assert_eq!(player.pump(&world, now).received, 1);
        let record = player.cache().get("boss").expect("replicated");
        assert_eq!(record.total_influence, 1);
        assert_eq!(player.metrics().updates_applied, 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn recompute_logs_contributions_at_debug() {
        let bus = LocalBus::new();
        let world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            gm.on_item_changed(&world, &ItemChange::character("boss"));
        });

        let text = String::from_utf8(logs.0.lock().clone()).expect("utf8 logs");
        assert!(text.contains("influence.contribution"));
        assert!(text.contains("Feared"));
    }

    #[test]
    fn unchanged_value_is_not_rebroadcast() {
        let bus = LocalBus::new();
        let world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        gm.on_item_changed(&world, &ItemChange::character("boss"));
        let again = gm.on_item_changed(&world, &ItemChange::character("boss"));
        assert_eq!(again, RefreshOutcome::Unchanged);
        assert_eq!(gm.pending_broadcasts(), 1);
    }

    #[test]
    fn dropping_to_zero_purges_everywhere() {
        let bus = LocalBus::new();
        let mut world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        let mut player = client(&bus, "p1", ClientRole::Player);
        let now = Instant::now();

        gm.on_item_changed(&world, &ItemChange::character("boss"));
        gm.pump(&world, now);
        player.pump(&world, now);
        assert!(player.cache().contains("boss"));

        if let Some(tag) = world.character_mut("boss").and_then(|sheet| sheet.tag_mut("fear")) {
            tag.state = Some(TagState::Neutral);
        }
        let outcome = gm.on_item_changed(&world, &ItemChange::character("boss"));
        assert_eq!(outcome, RefreshOutcome::Removed);
        gm.pump(&world, now);
        player.pump(&world, now);
        assert!(gm.cache().is_empty());
        assert!(player.cache().is_empty());
    }

    #[test]
    fn late_joiner_receives_snapshot() {
        let bus = LocalBus::new();
        let world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        gm.on_item_changed(&world, &ItemChange::character("boss"));
        let now = Instant::now();
        gm.pump(&world, now);

        let mut player = client(&bus, "late", ClientRole::Player);
        player.on_session_joined();
        assert!(player.awaiting_snapshot());
        player.pump(&world, now);
        gm.pump(&world, now);
        player.pump(&world, now);

        assert!(!player.awaiting_snapshot());
        assert_eq!(player.cache(), gm.cache());
        assert_eq!(gm.metrics().snapshots_served, 1);
    }

    #[test]
    fn overflowing_inbound_values_are_dropped() {
        let bus = LocalBus::new();
        let world = world();
        let mut player = client(&bus, "p1", ClientRole::Player);
        let boss = world.character("boss").expect("boss");
        let mut huge = build_record(IdentityKey::from("boss"), None, &boss, InfluenceScore::new(1, 0));
        huge.tag_influence = i64::MAX;

        player.handle_envelope(SyncEnvelope::new(
            ClientId::from("gm"),
            0,
            SyncMessage::InfluenceUpdate {
                identity_key: IdentityKey::from("boss"),
                record: huge.clone(),
            },
        ));
        assert!(player.cache().is_empty());

        let sane = build_record(IdentityKey::from("x"), None, &boss, InfluenceScore::new(2, 0));
        player.handle_envelope(SyncEnvelope::new(
            ClientId::from("gm"),
            1,
            SyncMessage::BulkSnapshot {
                requester_id: ClientId::from("p1"),
                records: vec![huge, sane],
            },
        ));
        assert_eq!(player.cache().keys(), vec![IdentityKey::from("x")]);
        assert_eq!(player.metrics().updates_applied, 0);
    }

    #[test]
    fn snapshot_for_someone_else_is_ignored() {
        let bus = LocalBus::new();
        let world = world();
        let mut player = client(&bus, "p1", ClientRole::Player);
        player.handle_envelope(SyncEnvelope::new(
            ClientId::from("gm"),
            0,
            SyncMessage::BulkSnapshot {
                requester_id: ClientId::from("p2"),
                records: vec![build_record(
                    IdentityKey::from("boss"),
                    None,
                    &world.character("boss").expect("boss"),
                    InfluenceScore::new(1, 0),
                )],
            },
        ));
        assert!(player.cache().is_empty());
    }

    #[test]
    fn update_key_wins_over_record_key() {
        let bus = LocalBus::new();
        let world = world();
        let mut player = client(&bus, "p1", ClientRole::Player);
        let mut record = build_record(
            IdentityKey::from("other"),
            None,
            &world.character("boss").expect("boss"),
            InfluenceScore::new(2, 1),
        );
        record.total_influence = 99;
        player.handle_envelope(SyncEnvelope::new(
            ClientId::from("gm"),
            0,
            SyncMessage::InfluenceUpdate {
                identity_key: IdentityKey::from("boss"),
                record,
            },
        ));
        let stored = player.cache().get("boss").expect("stored under message key");
        assert_eq!(stored.identity_key.as_str(), "boss");
        assert_eq!(stored.total_influence, 3);
        assert!(!player.cache().contains("other"));
    }

    #[test]
    fn refresh_signal_makes_player_request_snapshot() {
        let bus = LocalBus::new();
        let mut player = client(&bus, "p1", ClientRole::Player);
        player.handle_envelope(SyncEnvelope::new(
            ClientId::from("gm"),
            4,
            SyncMessage::RefreshSignal,
        ));
        assert!(player.awaiting_snapshot());
        assert_eq!(player.pending_broadcasts(), 1);
    }

    #[test]
    fn deleting_unlinked_token_purges_its_record() {
        let bus = LocalBus::new();
        let mut world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        if let Some(sheet) = world.token_sheet_mut("tok-thug") {
            *sheet = sheet.clone().with_status("wounded", "Wounded", TagState::Negative, 2);
        }
        gm.on_token_created(&world, "tok-thug");
        assert!(gm.cache().contains("tok-thug"));

        let token = world.remove_token("tok-thug").expect("token");
        assert!(gm.on_token_deleted(&token));
        assert!(!gm.cache().contains("tok-thug"));
    }

    #[test]
    fn deleting_linked_token_keeps_character_record() {
        let bus = LocalBus::new();
        let mut world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        gm.on_token_created(&world, "tok-boss");
        let token = world.remove_token("tok-boss").expect("token");
        assert!(!gm.on_token_deleted(&token));
        assert!(gm.cache().contains("boss"));
    }

    #[test]
    fn scene_pass_waits_for_settle_delay() {
        let bus = LocalBus::new();
        let world = world();
        let config = SyncConfig {
            settle_delay_ms: 200,
            ..SyncConfig::immediate()
        };
        let mut gm = SyncCoordinator::new(
            ClientRole::Authority,
            bus.connect(ClientId::from("gm")),
            Arc::new(config),
        );
        let start = Instant::now();
        gm.on_scene_ready(start);
        assert!(!gm.pump(&world, start).scene_pass);
        assert!(gm.cache().is_empty());

        let report = gm.pump(&world, start + std::time::Duration::from_millis(200));
        assert!(report.scene_pass);
        assert!(gm.cache().contains("boss"));
        assert_eq!(gm.metrics().audits_run, 1);
    }

    #[test]
    fn player_cannot_audit() {
        let bus = LocalBus::new();
        let world = world();
        let mut player = client(&bus, "p1", ClientRole::Player);
        assert!(player.run_audit(&world).is_none());
        let summary = player.manual_sync(&world, Instant::now());
        assert!(summary.audit.is_none());
        assert!(summary.snapshot_requested);
    }

    #[test]
    fn send_failures_are_counted_not_retried() {
        let bus = LocalBus::new();
        let world = world();
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        bus.disconnect(&ClientId::from("gm"));
        gm.on_item_changed(&world, &ItemChange::character("boss"));
        let report = gm.pump(&world, Instant::now());
        assert_eq!(report.sent, 0);
        assert_eq!(gm.metrics().send_failures, 1);
        assert_eq!(gm.pending_broadcasts(), 0);
    }

    #[test]
    fn scene_total_counts_linked_identity_once() {
        let bus = LocalBus::new();
        let mut world = world();
        world.place_token("lair", "tok-boss-2", "Boss", "boss", true);
        let mut gm = client(&bus, "gm", ClientRole::Authority);
        gm.manual_sync(&world, Instant::now());
        assert_eq!(gm.scene_total(&world), 1);
        let parts = gm.scene_contributions(&world);
        assert_eq!(parts[0].token_count, 2);
    }
}
