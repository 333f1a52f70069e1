//! Closed-loop bitrate controller.
//!
//! Consumes the client's LOSS_STATS / CONNECTION_STATUS telemetry and
//! proposes multiplicative bitrate changes within configured bounds. The
//! pipeline commits a proposal by calling `reconfigure_bitrate` on the
//! encoder and reporting the outcome back through [`AutoBitrateController::confirm_bitrate_change`] —
//! controller state only advances on encoder-confirmed changes.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use beamcast_core::AutoBitrateSettings;

use crate::protocol::BitrateStats;
use crate::session::Session;

// ── Per-session state ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SessionState {
    last_reported_good_frame: u64,
    last_loss_stats_time: Instant,
    last_adjustment_time: Instant,
    last_successful_adjustment_time: Instant,
    session_start_time: Instant,
    loss_percentage: f64,
    /// 0 = OKAY, 1 = POOR. Never waiting on a first message: absent ≡ OKAY.
    connection_status: u8,
    current_bitrate_kbps: u32,
    adjustment_count: u32,
}

impl SessionState {
    fn new(initial_bitrate_kbps: u32, now: Instant) -> Self {
        Self {
            last_reported_good_frame: 0,
            last_loss_stats_time: now,
            last_adjustment_time: now,
            last_successful_adjustment_time: now,
            session_start_time: now,
            loss_percentage: 0.0,
            connection_status: 0,
            current_bitrate_kbps: initial_bitrate_kbps,
            adjustment_count: 0,
        }
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

pub struct AutoBitrateController {
    settings: AutoBitrateSettings,
    states: Mutex<HashMap<u32, SessionState>>,
}

impl AutoBitrateController {
    pub fn new(settings: AutoBitrateSettings) -> Self {
        Self { settings, states: Mutex::new(HashMap::new()) }
    }

    pub fn settings(&self) -> &AutoBitrateSettings {
        &self.settings
    }

    /// Inferred-loss path (V2, `count == 0`): loss is derived from the
    /// `lastGoodFrame` progression against the framerate.
    pub fn process_loss_stats(&self, session: &Session, last_good_frame: u64, interval_ms: u32) {
        self.process_loss_stats_at(session, last_good_frame, interval_ms, Instant::now());
    }

    pub(crate) fn process_loss_stats_at(
        &self,
        session: &Session,
        last_good_frame: u64,
        interval_ms: u32,
        now: Instant,
    ) {
        if !session.auto_bitrate_enabled {
            return;
        }
        let mut states = self.states.lock();
        let state = Self::state_for(&mut states, session, now);

        state.loss_percentage =
            compute_loss_percentage(state.last_reported_good_frame, last_good_frame, interval_ms, session);
        state.last_reported_good_frame = last_good_frame;
        state.last_loss_stats_time = now;
    }

    /// Entry point for a raw LOSS_STATS report, arbitrating between the V1
    /// (direct count) and V2 (inferred) paths. A non-zero `count` is only
    /// trusted when it lands within 2× of the framerate-derived estimate;
    /// otherwise the inferred value wins.
    pub fn process_loss_stats_report(
        &self,
        session: &Session,
        count: u32,
        last_good_frame: u64,
        interval_ms: u32,
    ) {
        self.process_loss_stats_report_at(session, count, last_good_frame, interval_ms, Instant::now());
    }

    pub(crate) fn process_loss_stats_report_at(
        &self,
        session: &Session,
        count: u32,
        last_good_frame: u64,
        interval_ms: u32,
        now: Instant,
    ) {
        if count == 0 {
            self.process_loss_stats_at(session, last_good_frame, interval_ms, now);
            return;
        }
        if !session.auto_bitrate_enabled {
            return;
        }

        let inferred = {
            let mut states = self.states.lock();
            let state = Self::state_for(&mut states, session, now);
            compute_loss_percentage(state.last_reported_good_frame, last_good_frame, interval_ms, session)
        };
        let fps = session.config.video.fps() as f64;
        let expected_frames = (fps * interval_ms as f64 / 1000.0).max(1.0);
        let direct = count as f64 / expected_frames * 100.0;

        let chosen = if (direct - inferred).abs() <= inferred * 2.0 + 10.0 {
            direct
        } else {
            debug!(
                "Direct loss {:.1}% rejected against inferred {:.1}%",
                direct, inferred
            );
            inferred
        };
        self.process_loss_stats_direct_at(session, chosen, last_good_frame, now);
    }

    /// Direct-loss path (V1, `count > 0`). The caller is expected to have
    /// sanity-checked the reported percentage against the inferred estimate.
    pub fn process_loss_stats_direct(&self, session: &Session, loss_pct: f64, last_good_frame: u64) {
        self.process_loss_stats_direct_at(session, loss_pct, last_good_frame, Instant::now());
    }

    pub(crate) fn process_loss_stats_direct_at(
        &self,
        session: &Session,
        loss_pct: f64,
        last_good_frame: u64,
        now: Instant,
    ) {
        if !session.auto_bitrate_enabled {
            return;
        }
        let mut states = self.states.lock();
        let state = Self::state_for(&mut states, session, now);
        state.loss_percentage = loss_pct;
        state.last_reported_good_frame = last_good_frame;
        state.last_loss_stats_time = now;
    }

    pub fn process_connection_status(&self, session: &Session, status: u8) {
        if !session.auto_bitrate_enabled {
            return;
        }
        let mut states = self.states.lock();
        let state = Self::state_for(&mut states, session, Instant::now());
        state.connection_status = if status == 0 { 0 } else { 1 };
    }

    /// True when a proposal would clear both the inter-adjustment interval
    /// and the minimum-delta threshold.
    pub fn should_adjust_bitrate(&self, session: &Session) -> bool {
        self.should_adjust_bitrate_at(session, Instant::now())
    }

    pub(crate) fn should_adjust_bitrate_at(&self, session: &Session, now: Instant) -> bool {
        if !session.auto_bitrate_enabled {
            return false;
        }
        let states = self.states.lock();
        let Some(state) = states.get(&session.launch_id) else {
            return false;
        };

        let since_last_ms = now.duration_since(state.last_adjustment_time).as_millis() as u64;
        let min_interval = self.settings.adjustment_interval_ms.max(1);
        if since_last_ms < min_interval {
            return false;
        }

        let factor = self.adjustment_factor(state, now);
        let min_delta = self.settings.min_adjustment_pct as f64 / 100.0;
        if self.settings.min_adjustment_pct == 0 {
            factor != 1.0
        } else {
            (factor - 1.0).abs() >= min_delta
        }
    }

    /// New bitrate proposal, clamped to the resolved bounds. Does not touch
    /// controller state.
    pub fn calculate_new_bitrate(&self, session: &Session) -> u32 {
        self.calculate_new_bitrate_at(session, Instant::now())
    }

    pub(crate) fn calculate_new_bitrate_at(&self, session: &Session, now: Instant) -> u32 {
        let configured = session.config.video.bitrate_kbps;
        if !session.auto_bitrate_enabled {
            return configured;
        }
        let states = self.states.lock();
        let Some(state) = states.get(&session.launch_id) else {
            return configured;
        };

        let factor = self.adjustment_factor(state, now);
        let proposed = (state.current_bitrate_kbps as f64 * factor) as u32;
        let (min, max) = self.resolve_bounds(session);
        proposed.clamp(min, max)
    }

    /// Resolved `[min, max]` bounds for this session, guaranteeing
    /// `1 ≤ min ≤ max`.
    pub fn resolve_bounds(&self, session: &Session) -> (u32, u32) {
        let client_min = session.auto_bitrate_min_kbps;
        let client_max = session.auto_bitrate_max_kbps;

        let server_min = if self.settings.min_kbps > 0 { self.settings.min_kbps } else { 1 };
        let server_max = if self.settings.max_kbps > 0 {
            if self.settings.max_bitrate_cap > 0 {
                self.settings.max_kbps.min(self.settings.max_bitrate_cap)
            } else {
                self.settings.max_kbps
            }
        } else {
            self.settings.max_bitrate_cap
        };

        let mut min = if client_min > 0 { client_min.max(server_min) } else { server_min };

        let mut max = if client_max > 0 {
            if server_max > 0 { client_max.min(server_max) } else { client_max }
        } else if server_max > 0 {
            server_max
        } else {
            let configured = session.config.video.bitrate_kbps;
            if configured >= 1 { configured } else { 1000 }
        };

        if min > max {
            min = max;
        }
        min = min.max(1);
        max = max.max(1);
        (min, max)
    }

    /// Record an attempt's outcome. The attempt timestamp always advances
    /// (no retry storms against refusing encoders); the bitrate, count, and
    /// success timestamp only advance when the encoder applied the change.
    pub fn confirm_bitrate_change(&self, session: &Session, new_bitrate_kbps: u32, success: bool) {
        self.confirm_bitrate_change_at(session, new_bitrate_kbps, success, Instant::now());
    }

    pub(crate) fn confirm_bitrate_change_at(
        &self,
        session: &Session,
        new_bitrate_kbps: u32,
        success: bool,
        now: Instant,
    ) {
        if !session.auto_bitrate_enabled {
            return;
        }
        let mut states = self.states.lock();
        let state = Self::state_for(&mut states, session, now);

        state.last_adjustment_time = now;
        if success && new_bitrate_kbps != state.current_bitrate_kbps {
            state.adjustment_count += 1;
            state.current_bitrate_kbps = new_bitrate_kbps;
            state.last_successful_adjustment_time = now;
            debug!(
                "Session {}: bitrate now {} kbps (adjustment #{})",
                session.launch_id, new_bitrate_kbps, state.adjustment_count
            );
        }
    }

    /// Drop all state for a session; a fresh session with the same inputs
    /// retraces the same trajectory.
    pub fn reset(&self, session: &Session) {
        self.states.lock().remove(&session.launch_id);
    }

    /// Snapshot for the BITRATE_STATS egress.
    pub fn get_stats(&self, session: &Session) -> Option<BitrateStats> {
        if !session.auto_bitrate_enabled {
            return None;
        }
        let states = self.states.lock();
        let state = states.get(&session.launch_id)?;

        let last_adjustment_time_ms = if state.adjustment_count > 0 {
            state
                .last_successful_adjustment_time
                .duration_since(state.session_start_time)
                .as_millis() as u64
        } else {
            0
        };

        Some(BitrateStats {
            current_bitrate_kbps: state.current_bitrate_kbps,
            last_adjustment_time_ms,
            adjustment_count: state.adjustment_count,
            loss_percentage: state.loss_percentage as f32,
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn state_for<'a>(
        states: &'a mut HashMap<u32, SessionState>,
        session: &Session,
        now: Instant,
    ) -> &'a mut SessionState {
        states
            .entry(session.launch_id)
            .or_insert_with(|| SessionState::new(session.config.video.bitrate_kbps, now))
    }

    fn adjustment_factor(&self, state: &SessionState, now: Instant) -> f64 {
        let s = &self.settings;
        let loss = state.loss_percentage;
        let since_last_ms = now.duration_since(state.last_adjustment_time).as_millis() as u64;

        let mut factor = if loss > s.loss_severe_pct as f64 {
            1.0 - s.decrease_severe_pct as f64 / 100.0
        } else if loss > s.loss_moderate_pct as f64 {
            1.0 - s.decrease_moderate_pct as f64 / 100.0
        } else if loss > s.loss_mild_pct as f64 {
            1.0 - s.decrease_mild_pct as f64 / 100.0
        } else if since_last_ms >= s.good_stability_ms && state.connection_status == 0 {
            1.0 + s.increase_good_pct as f64 / 100.0
        } else {
            return 1.0;
        };

        if state.connection_status == 1 {
            factor = factor.min(1.0 - s.poor_status_cap_pct as f64 / 100.0);
        }

        if factor > 1.0 && since_last_ms < s.increase_min_interval_ms {
            return 1.0;
        }
        factor
    }
}

/// Expected-progression loss estimate.
///
/// `expected = last_reported + fps · Δt`; anything the client's
/// `lastGoodFrame` trails behind that is counted lost. The first report has
/// no baseline and reads as 0 loss.
fn compute_loss_percentage(
    last_reported_good_frame: u64,
    last_good_frame: u64,
    interval_ms: u32,
    session: &Session,
) -> f64 {
    if last_reported_good_frame == 0 {
        return 0.0;
    }

    let fps = session.config.video.fps();
    let expected_frames = fps as f64 * (interval_ms as f64 / 1000.0);
    if expected_frames <= 0.0 {
        return 0.0;
    }

    let expected_now = last_reported_good_frame + expected_frames as u64;
    let lost = expected_now.saturating_sub(last_good_frame);
    lost as f64 / expected_frames * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use beamcast_core::SessionConfig;

    use crate::launch::test_launch_session;

    fn controller() -> AutoBitrateController {
        AutoBitrateController::new(AutoBitrateSettings::default())
    }

    fn session_60fps(bitrate: u32) -> Arc<Session> {
        let mut config = SessionConfig::default();
        config.video.framerate = 60;
        config.video.bitrate_kbps = bitrate;
        Session::alloc(config, &test_launch_session()).unwrap()
    }

    #[test]
    fn fresh_session_with_clean_stats_never_adjusts() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        // 10 reports at 50 ms, client keeping perfect pace at 60 fps
        for k in 1..=10u64 {
            let now = t0 + Duration::from_millis(50 * k);
            ctl.process_loss_stats_at(&session, 60 * k / 20, 50, now);
            assert!(
                ctl.get_stats(&session).unwrap().loss_percentage <= f32::EPSILON,
                "report {k} showed loss"
            );
        }
        let stats = ctl.get_stats(&session).unwrap();
        assert_eq!(stats.adjustment_count, 0);
        assert_eq!(stats.current_bitrate_kbps, 20_000);
        assert_eq!(stats.last_adjustment_time_ms, 0);
    }

    #[test]
    fn first_report_is_zero_loss_even_when_behind() {
        let ctl = controller();
        let session = session_60fps(20_000);
        ctl.process_loss_stats_at(&session, 1, 50, Instant::now());
        assert_eq!(ctl.get_stats(&session).unwrap().loss_percentage, 0.0);
    }

    #[test]
    fn severe_loss_spike_proposes_25_percent_cut() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        // Baseline report, then at t=5 s a report 12 frames short over a
        // 50 ms interval @ 60fps
        ctl.process_loss_stats_at(&session, 300, 50, t0);
        let t1 = t0 + Duration::from_secs(5);
        // expected = 300 + 3; client reports only 291 → 12 lost of 3 expected
        ctl.process_loss_stats_at(&session, 291, 50, t1);

        let loss = ctl.get_stats(&session).unwrap().loss_percentage;
        assert!(loss > 100.0, "capless loss math: got {loss}");

        assert!(ctl.should_adjust_bitrate_at(&session, t1));
        let new = ctl.calculate_new_bitrate_at(&session, t1);
        assert_eq!(new, 15_000); // 20_000 × 0.75

        ctl.confirm_bitrate_change_at(&session, new, true, t1);
        let stats = ctl.get_stats(&session).unwrap();
        assert_eq!(stats.adjustment_count, 1);
        assert_eq!(stats.current_bitrate_kbps, 15_000);
    }

    #[test]
    fn recovery_proposes_increase_after_stability_window() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        // Take the severe cut at t=5s
        ctl.process_loss_stats_at(&session, 300, 50, t0);
        let t_cut = t0 + Duration::from_secs(5);
        ctl.process_loss_stats_at(&session, 291, 50, t_cut);
        let cut = ctl.calculate_new_bitrate_at(&session, t_cut);
        ctl.confirm_bitrate_change_at(&session, cut, true, t_cut);

        // 6 s of clean reports afterwards
        let mut frame = 291u64;
        for k in 1..=120u64 {
            let now = t_cut + Duration::from_millis(50 * k);
            frame += 3;
            ctl.process_loss_stats_at(&session, frame, 50, now);
        }

        // Past good_stability_ms since the cut, OKAY status → +5% proposed
        let t_recover = t_cut + Duration::from_secs(6);
        assert!(ctl.should_adjust_bitrate_at(&session, t_recover));
        let new = ctl.calculate_new_bitrate_at(&session, t_recover);
        assert_eq!(new, (cut as f64 * 1.05) as u32);
    }

    #[test]
    fn poor_status_overrides_clean_loss() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        ctl.process_loss_stats_at(&session, 300, 50, t0);
        ctl.process_loss_stats_at(&session, 303, 50, t0 + Duration::from_millis(50));
        ctl.process_connection_status(&session, 1); // POOR

        // Clean loss but POOR caps the factor at 0.75 even in the increase window
        let t1 = t0 + Duration::from_secs(10);
        assert!(ctl.should_adjust_bitrate_at(&session, t1));
        let new = ctl.calculate_new_bitrate_at(&session, t1);
        assert_eq!(new, 15_000);
    }

    #[test]
    fn small_factor_changes_are_rejected() {
        let settings = AutoBitrateSettings { increase_good_pct: 3, ..Default::default() };
        let ctl = AutoBitrateController::new(settings);
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        ctl.process_loss_stats_at(&session, 300, 50, t0);
        // +3% proposal < min_adjustment_pct (5) → rejected
        assert!(!ctl.should_adjust_bitrate_at(&session, t0 + Duration::from_secs(10)));
    }

    #[test]
    fn adjustment_interval_gates_proposals() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        ctl.process_loss_stats_at(&session, 300, 50, t0);
        ctl.process_loss_stats_at(&session, 100, 50, t0 + Duration::from_millis(50));
        // Severe loss but only 50 ms since state creation → blocked
        assert!(!ctl.should_adjust_bitrate_at(&session, t0 + Duration::from_millis(100)));
        assert!(ctl.should_adjust_bitrate_at(&session, t0 + Duration::from_millis(3200)));
    }

    #[test]
    fn failed_reconfigure_backs_off_but_keeps_bitrate() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        ctl.process_loss_stats_at(&session, 300, 50, t0);
        let t1 = t0 + Duration::from_secs(4);
        ctl.process_loss_stats_at(&session, 100, 50, t1);
        let new = ctl.calculate_new_bitrate_at(&session, t1);
        ctl.confirm_bitrate_change_at(&session, new, false, t1);

        let stats = ctl.get_stats(&session).unwrap();
        assert_eq!(stats.adjustment_count, 0);
        assert_eq!(stats.current_bitrate_kbps, 20_000);
        // Retry is gated by the interval even though nothing applied
        assert!(!ctl.should_adjust_bitrate_at(&session, t1 + Duration::from_millis(500)));
    }

    #[test]
    fn bounds_resolution_honours_client_and_server() {
        let session = session_60fps(20_000);

        // Defaults: min 1, no server max → session bitrate is the ceiling
        let ctl = controller();
        assert_eq!(ctl.resolve_bounds(&session), (1, 20_000));

        // Server cap below client max wins
        let ctl = AutoBitrateController::new(AutoBitrateSettings {
            max_bitrate_cap: 12_000,
            ..Default::default()
        });
        assert_eq!(ctl.resolve_bounds(&session), (1, 12_000));

        // min == max pins the controller
        let ctl = AutoBitrateController::new(AutoBitrateSettings {
            min_kbps: 12_000,
            max_bitrate_cap: 12_000,
            ..Default::default()
        });
        assert_eq!(ctl.resolve_bounds(&session), (12_000, 12_000));
    }

    #[test]
    fn min_equals_max_never_changes_bitrate() {
        let ctl = AutoBitrateController::new(AutoBitrateSettings {
            min_kbps: 20_000,
            max_kbps: 20_000,
            ..Default::default()
        });
        let session = session_60fps(20_000);
        let t0 = Instant::now();
        ctl.process_loss_stats_at(&session, 300, 50, t0);
        ctl.process_loss_stats_at(&session, 100, 50, t0 + Duration::from_millis(50));
        let t1 = t0 + Duration::from_secs(4);
        assert_eq!(ctl.calculate_new_bitrate_at(&session, t1), 20_000);
    }

    #[test]
    fn millifps_framerate_is_decoded_in_loss_math() {
        let ctl = controller();
        let mut config = SessionConfig::default();
        config.video.framerate = 59_940; // 59.94 fps in millifps
        config.video.bitrate_kbps = 20_000;
        let session = Session::alloc(config, &test_launch_session()).unwrap();
        let t0 = Instant::now();

        ctl.process_loss_stats_at(&session, 600, 1000, t0);
        // One second later the client should be ~60 frames ahead; keeping
        // pace means ~0 loss. If millifps were taken literally the expected
        // progression would be ~59,940 frames and loss would read ~100%.
        ctl.process_loss_stats_at(&session, 659, 1000, t0 + Duration::from_secs(1));
        let loss = ctl.get_stats(&session).unwrap().loss_percentage;
        assert!(loss < 2.0, "millifps misread: loss = {loss}");
    }

    #[test]
    fn reset_gives_fresh_trajectory() {
        let ctl = controller();
        let session = session_60fps(20_000);
        let t0 = Instant::now();

        ctl.process_loss_stats_at(&session, 300, 50, t0);
        ctl.process_loss_stats_at(&session, 100, 50, t0 + Duration::from_millis(50));
        ctl.confirm_bitrate_change_at(&session, 15_000, true, t0 + Duration::from_secs(4));
        assert_eq!(ctl.get_stats(&session).unwrap().adjustment_count, 1);

        ctl.reset(&session);
        assert!(ctl.get_stats(&session).is_none());

        // Same inputs after reset behave like a fresh session
        ctl.process_loss_stats_at(&session, 300, 50, t0 + Duration::from_secs(10));
        let stats = ctl.get_stats(&session).unwrap();
        assert_eq!(stats.adjustment_count, 0);
        assert_eq!(stats.current_bitrate_kbps, 20_000);
        assert_eq!(stats.loss_percentage, 0.0);
    }

    #[test]
    fn disabled_sessions_are_ignored() {
        let ctl = controller();
        let mut launch = test_launch_session();
        launch.auto_bitrate_enabled = false;
        let session = Session::alloc(SessionConfig::default(), &launch).unwrap();

        ctl.process_loss_stats(&session, 100, 50);
        assert!(ctl.get_stats(&session).is_none());
        assert!(!ctl.should_adjust_bitrate(&session));
    }
}
