use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::accessibility::ElementFinder;
use crate::config::{AccessibilityConfig, DetectionConfig};
use crate::errors::WaypostResult;
use crate::guidance::intent::IntentClassifier;
use crate::guidance::parser::{self, ParsedGuidance};
use crate::guidance::presenter::{Highlight, Presenter, SpeechBubble};
use crate::guidance::prompts;
use crate::guidance::resolver::{CoordinateResolver, ResolvedCoordinate};
use crate::guidance::triggers::{Subscription, TriggerKind, TriggerSource};
use crate::llm::registry::ProviderRegistry;
use crate::perception::differ::{byte_delta_exceeds, is_major_change, FrameDiffer, HashStrategy};
use crate::perception::screenshot::ScreenCapture;
use crate::perception::types::{CapturedFrame, FrameStats};

const CELEBRATION: &str = "🎉 Great job! Goal complete.";
const SCREEN_CHANGED_PREFIX: &str = "Screen changed: ";
const CAPTURE_APOLOGY: &str =
    "I can't see your screen right now. Check the screen recording permission and ask me again.";
const MODEL_APOLOGY: &str = "I hit a problem talking to the model. Please ask me again.";
const BUSY_REPLY: &str = "One moment, I'm still checking your screen.";

/// The user's current objective. Lifecycle state lives in `SessionState`.
#[derive(Debug, Clone)]
pub struct Goal {
    pub text: String,
    pub last_guidance: Option<String>,
}

/// Goal lifecycle × in-flight flag as one tagged state, so "processing with
/// no goal" is unrepresentable. `Busy` doubles as the reentrancy guard:
/// every trigger that finds it no-ops instead of queueing.
#[derive(Debug, Clone)]
enum SessionState {
    Idle,
    Ready { goal: Goal },
    Busy { goal: Goal },
}

#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub ts: DateTime<Utc>,
    pub role: String,
    pub text: String,
}

struct SessionInner {
    state: SessionState,
    last_frame: Option<FrameStats>,
    /// Bumped on every new goal and every reset. Cycle results carrying a
    /// stale generation are discarded, which is how a model response that
    /// lands after `reset()` becomes a no-op.
    generation: u64,
    transcript: Vec<TranscriptEntry>,
    subscriptions: Vec<Subscription>,
}

/// What kind of event started a cycle. Background cycles get the
/// screen-changed prefix, duplicate suppression, and silent error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleTrigger {
    Initial,
    Manual,
    Background,
}

struct CycleOutput {
    parsed: ParsedGuidance,
    resolved: Option<ResolvedCoordinate>,
    stats: FrameStats,
}

/// One guidance session: owns the goal, the last guidance text, and the last
/// frame fingerprint. Construct one per window/host; all mutation funnels
/// through its methods.
pub struct GuidanceSession {
    inner: Mutex<SessionInner>,
    registry: Arc<AsyncMutex<ProviderRegistry>>,
    capture: Arc<dyn ScreenCapture>,
    presenter: Arc<dyn Presenter>,
    resolver: CoordinateResolver,
    classifier: IntentClassifier,
    differ: FrameDiffer,
    detection: DetectionConfig,
}

impl GuidanceSession {
    pub fn new(
        registry: Arc<AsyncMutex<ProviderRegistry>>,
        capture: Arc<dyn ScreenCapture>,
        finder: Option<Arc<dyn ElementFinder>>,
        presenter: Arc<dyn Presenter>,
        detection: DetectionConfig,
        accessibility: AccessibilityConfig,
    ) -> Self {
        let finder = if accessibility.enabled { finder } else { None };
        Self {
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                last_frame: None,
                generation: 0,
                transcript: Vec::new(),
                subscriptions: Vec::new(),
            }),
            resolver: CoordinateResolver::new(
                finder,
                Duration::from_millis(accessibility.lookup_timeout_ms),
            ),
            classifier: IntentClassifier::new(registry.clone()),
            differ: FrameDiffer::new(HashStrategy::from_name(&detection.hash_strategy)),
            registry,
            capture,
            presenter,
            detection,
        }
    }

    // ── Public surface ──────────────────────────────────────────────────

    /// Handles one user chat message. Conversational messages get a reply
    /// without touching goal state; task messages start a new goal and run
    /// the first guidance cycle, returning its display text.
    pub async fn process_user_message(&self, text: &str) -> WaypostResult<String> {
        self.push_transcript("user", text);

        let intent = self.classifier.classify(text).await;
        if !intent.is_task {
            let reply = self.conversational_reply(text).await;
            self.push_transcript("assistant", &reply);
            return Ok(reply);
        }

        let gen = {
            let mut inner = self.lock_inner();
            if matches!(inner.state, SessionState::Busy { .. }) {
                tracing::debug!("task message arrived mid-cycle, short-circuiting");
                inner.transcript.push(TranscriptEntry {
                    ts: Utc::now(),
                    role: "assistant".to_string(),
                    text: BUSY_REPLY.to_string(),
                });
                return Ok(BUSY_REPLY.to_string());
            }
            inner.generation += 1;
            inner.last_frame = None;
            inner.state = SessionState::Busy {
                goal: Goal {
                    text: intent.description.clone(),
                    last_guidance: None,
                },
            };
            tracing::info!(goal = %intent.description, generation = inner.generation, "goal started");
            inner.generation
        };

        let reply = self
            .run_cycle(&intent.description, None, gen, None, CycleTrigger::Initial)
            .await
            .unwrap_or_else(|| MODEL_APOLOGY.to_string());
        self.push_transcript("assistant", &reply);
        Ok(reply)
    }

    /// Explicit "check my screen" from a hotkey or button. No-op while a
    /// cycle is in flight or when there is no active goal.
    pub async fn trigger_manual_check(&self) -> WaypostResult<Option<String>> {
        let Some((goal, gen)) = self.begin_cycle() else {
            return Ok(None);
        };

        let reply = self
            .run_cycle(
                &goal.text,
                goal.last_guidance.as_deref(),
                gen,
                None,
                CycleTrigger::Manual,
            )
            .await;
        if let Some(text) = &reply {
            self.push_transcript("assistant", text);
        }
        Ok(reply)
    }

    /// Popup/major-change watcher entry point. Cheap change gating happens
    /// here so ordinary minor deltas (cursor blink, animation) never cost a
    /// model call. Errors are logged, never surfaced as chat output.
    pub async fn handle_background_signal(&self, frame: CapturedFrame) -> Option<String> {
        let new_stats = FrameStats {
            fingerprint: self.differ.fingerprint(&frame.bytes),
            byte_len: frame.byte_len(),
        };

        let started = {
            let mut inner = self.lock_inner();
            let SessionState::Ready { goal } = &inner.state else {
                return None;
            };
            let goal = goal.clone();

            let major = match &inner.last_frame {
                Some(prev) => {
                    byte_delta_exceeds(
                        prev.byte_len,
                        new_stats.byte_len,
                        self.detection.popup_byte_threshold,
                    ) || is_major_change(
                        &prev.fingerprint,
                        &new_stats.fingerprint,
                        self.detection.hash_distance_threshold,
                    )
                }
                // No baseline yet: fail open and look.
                None => true,
            };
            inner.last_frame = Some(new_stats.clone());

            if !major {
                tracing::trace!("background frame below change thresholds, skipping");
                return None;
            }
            inner.state = SessionState::Busy { goal: goal.clone() };
            Some((goal, inner.generation))
        };

        let (goal, gen) = started?;
        tracing::info!(goal = %goal.text, "major screen change detected");

        let reply = self
            .run_cycle(
                &goal.text,
                goal.last_guidance.as_deref(),
                gen,
                Some(frame),
                CycleTrigger::Background,
            )
            .await;
        if let Some(text) = &reply {
            self.push_transcript("assistant", text);
        }
        reply
    }

    /// Captures a frame and feeds it to the background watcher. Used by the
    /// poll loop and click/window triggers; all failures are silent.
    pub async fn background_poll_once(&self) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        match self.capture.capture().await {
            Ok(frame) => self.handle_background_signal(frame).await,
            Err(e) => {
                tracing::warn!(error = %e, "background capture failed");
                None
            }
        }
    }

    /// Unconditionally clears goal, last guidance, last frame, the in-flight
    /// guard, and all trigger subscriptions; hides any presentation.
    /// Idempotent. An in-flight model call is not aborted, but its result
    /// arrives with a stale generation and is discarded.
    pub fn reset(&self) {
        let subs = {
            let mut inner = self.lock_inner();
            inner.state = SessionState::Idle;
            inner.last_frame = None;
            inner.generation += 1;
            std::mem::take(&mut inner.subscriptions)
        };
        drop(subs);
        self.presenter.clear_highlights();
        self.presenter.dismiss_speech_bubble();
        tracing::info!("session reset");
    }

    pub fn current_goal_text(&self) -> Option<String> {
        match &self.lock_inner().state {
            SessionState::Idle => None,
            SessionState::Ready { goal } | SessionState::Busy { goal } => Some(goal.text.clone()),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.lock_inner().state, SessionState::Idle)
    }

    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.lock_inner().transcript.clone()
    }

    /// Hooks this session up to the host's trigger sources. A hotkey runs a
    /// manual check; click and window-shown events go through the background
    /// gate. Handles are released on reset or teardown.
    pub fn attach_triggers(self: &Arc<Self>, source: &dyn TriggerSource) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("attach_triggers called outside a tokio runtime, ignoring");
            return;
        };
        let mut subs = Vec::new();
        for kind in [
            TriggerKind::Hotkey,
            TriggerKind::Click,
            TriggerKind::WindowShown,
        ] {
            let weak = Arc::downgrade(self);
            let runtime = runtime.clone();
            subs.push(source.subscribe(
                kind,
                Box::new(move || {
                    let Some(session) = weak.upgrade() else {
                        return;
                    };
                    runtime.spawn(async move {
                        match kind {
                            TriggerKind::Hotkey => {
                                if let Err(e) = session.trigger_manual_check().await {
                                    tracing::warn!(error = %e, "hotkey check failed");
                                }
                            }
                            TriggerKind::Click | TriggerKind::WindowShown => {
                                session.background_poll_once().await;
                            }
                        }
                    });
                }),
            ));
        }
        self.lock_inner().subscriptions.extend(subs);
    }

    // ── Cycle internals ─────────────────────────────────────────────────

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the in-flight slot. `None` when idle or already busy.
    fn begin_cycle(&self) -> Option<(Goal, u64)> {
        let mut inner = self.lock_inner();
        match &inner.state {
            SessionState::Ready { goal } => {
                let goal = goal.clone();
                inner.state = SessionState::Busy { goal: goal.clone() };
                Some((goal, inner.generation))
            }
            SessionState::Idle => None,
            SessionState::Busy { .. } => {
                tracing::debug!("cycle already in flight, trigger ignored");
                None
            }
        }
    }

    /// Busy → Ready without touching the goal, e.g. after a failed cycle.
    fn release_busy(&self, gen: u64) {
        let mut inner = self.lock_inner();
        if inner.generation != gen {
            return;
        }
        let goal = match &inner.state {
            SessionState::Busy { goal } => goal.clone(),
            _ => return,
        };
        inner.state = SessionState::Ready { goal };
    }

    /// One capture → analyze → parse → resolve → present cycle. Returns the
    /// text to show the user, or `None` (suppressed, stale, or a background
    /// failure). The caller has already moved the session to `Busy`.
    async fn run_cycle(
        &self,
        goal_text: &str,
        previous_guidance: Option<&str>,
        gen: u64,
        frame: Option<CapturedFrame>,
        trigger: CycleTrigger,
    ) -> Option<String> {
        let frame = match frame {
            Some(frame) => frame,
            None => match self.capture.capture().await {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!(error = %e, "screen capture failed");
                    self.release_busy(gen);
                    return match trigger {
                        CycleTrigger::Background => None,
                        _ => Some(CAPTURE_APOLOGY.to_string()),
                    };
                }
            },
        };

        let output = match self.analyze_frame(goal_text, previous_guidance, frame).await {
            Ok(output) => output,
            Err(e) => {
                tracing::error!(error = %e, "guidance model call failed");
                self.release_busy(gen);
                return match trigger {
                    CycleTrigger::Background => None,
                    _ => Some(MODEL_APOLOGY.to_string()),
                };
            }
        };

        self.apply_cycle(gen, output, trigger)
    }

    async fn analyze_frame(
        &self,
        goal_text: &str,
        previous_guidance: Option<&str>,
        frame: CapturedFrame,
    ) -> WaypostResult<CycleOutput> {
        let stats = FrameStats {
            fingerprint: self.differ.fingerprint(&frame.bytes),
            byte_len: frame.byte_len(),
        };

        let (provider, cfg) = {
            let reg = self.registry.lock().await;
            reg.call_config_for_role("vision")?
        };

        let prompt = prompts::build_guidance_prompt(goal_text, previous_guidance);
        let text = provider
            .analyze(
                std::slice::from_ref(&frame.bytes),
                &prompt,
                Some(prompts::GUIDANCE_SYSTEM_PROMPT),
                &cfg,
            )
            .await?;

        let parsed = parser::parse(&text);
        tracing::debug!(
            complete = parsed.is_complete,
            has_target = parsed.target.is_some(),
            has_coords = parsed.coordinates.is_some(),
            "model response parsed"
        );

        let resolved = if parsed.is_complete {
            None
        } else {
            self.resolver
                .resolve(parsed.target.as_ref(), parsed.coordinates.as_ref())
                .await
        };

        Ok(CycleOutput {
            parsed,
            resolved,
            stats,
        })
    }

    /// Commits a finished cycle: state transition, last-guidance update, and
    /// presentation. Discards everything if the generation moved on.
    fn apply_cycle(&self, gen: u64, output: CycleOutput, trigger: CycleTrigger) -> Option<String> {
        // Released after the lock: a cancel callback may reach back into us.
        let mut released: Vec<Subscription> = Vec::new();
        let reply = {
            let mut inner = self.lock_inner();
            if inner.generation != gen {
                tracing::info!("cycle result is stale after reset, discarding");
                return None;
            }
            let SessionState::Busy { goal } = &inner.state else {
                tracing::warn!("cycle finished but session is not busy, discarding");
                return None;
            };
            let mut goal = goal.clone();
            inner.last_frame = Some(output.stats.clone());

            if output.parsed.is_complete {
                tracing::info!(goal = %goal.text, "goal completed");
                inner.state = SessionState::Idle;
                released = std::mem::take(&mut inner.subscriptions);
                Some(format!("{}\n\n{}", output.parsed.display_text, CELEBRATION))
            } else {
                let display = match trigger {
                    CycleTrigger::Background => {
                        format!("{SCREEN_CHANGED_PREFIX}{}", output.parsed.display_text)
                    }
                    _ => output.parsed.display_text.clone(),
                };

                // A cosmetically different response for the same step should
                // not repeat in chat.
                let duplicate = trigger == CycleTrigger::Background
                    && goal
                        .last_guidance
                        .as_deref()
                        .map(|prev| {
                            normalize_guidance(prev)
                                == normalize_guidance(&output.parsed.display_text)
                        })
                        .unwrap_or(false);

                goal.last_guidance = Some(output.parsed.display_text.clone());
                inner.state = SessionState::Ready { goal };

                if duplicate {
                    tracing::debug!("guidance unchanged after normalization, suppressing");
                    None
                } else {
                    Some(display)
                }
            }
        };

        drop(released);

        // Presentation happens outside the lock; the sink is fire-and-forget.
        if output.parsed.is_complete {
            self.presenter.clear_highlights();
            self.presenter.dismiss_speech_bubble();
        } else if reply.is_some() {
            self.present(&output.parsed.display_text, output.resolved.as_ref());
        }

        reply
    }

    fn present(&self, text: &str, resolved: Option<&ResolvedCoordinate>) {
        self.presenter.clear_highlights();
        match resolved {
            Some(coord) => {
                self.presenter.show_highlight(&Highlight {
                    id: uuid::Uuid::new_v4().to_string(),
                    x: coord.x,
                    y: coord.y,
                    width: coord.width,
                    height: coord.height,
                    source: coord.source,
                });
                self.presenter.show_speech_bubble(&SpeechBubble {
                    text: text.to_string(),
                    x: coord.x,
                    y: (coord.y - 60.0).max(0.0),
                });
            }
            None => {
                // No coordinates from either source: say less, point less.
                self.presenter.dismiss_speech_bubble();
            }
        }
    }

    async fn conversational_reply(&self, message: &str) -> String {
        let call = {
            let reg = self.registry.lock().await;
            reg.call_config_for_role("chat")
        };
        if let Ok((provider, cfg)) = call {
            match provider
                .analyze(&[], message, Some(prompts::CHAT_SYSTEM_PROMPT), &cfg)
                .await
            {
                Ok(reply) if !reply.trim().is_empty() => return reply.trim().to_string(),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "chat reply failed, using canned reply"),
            }
        }
        prompts::CANNED_CHAT_REPLY.to_string()
    }

    fn push_transcript(&self, role: &str, text: &str) {
        self.lock_inner().transcript.push(TranscriptEntry {
            ts: Utc::now(),
            role: role.to_string(),
            text: text.to_string(),
        });
    }
}

/// Lowercased, punctuation-stripped, whitespace-collapsed, truncated to 80
/// chars. Two responses that normalize equal are the same instruction.
fn normalize_guidance(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(80).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{WaypostError, WaypostResult};
    use crate::llm::provider::VisionProvider;
    use crate::llm::types::CallConfig;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Test doubles ────────────────────────────────────────────────────

    struct ScriptedProvider {
        responses: Mutex<VecDeque<String>>,
        calls: AtomicUsize,
        gate: Option<Arc<tokio::sync::Semaphore>>,
    }

    impl ScriptedProvider {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
                gate: None,
            })
        }

        fn gated(responses: &[&str], gate: Arc<tokio::sync::Semaphore>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
                gate: Some(gate),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VisionProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn analyze(
            &self,
            _frames: &[Vec<u8>],
            _prompt: &str,
            _system: Option<&str>,
            _cfg: &CallConfig,
        ) -> WaypostResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| WaypostError::LlmProvider("script exhausted".into()))
        }
    }

    struct CountingSource {
        cancelled: Arc<AtomicUsize>,
    }

    impl TriggerSource for CountingSource {
        fn subscribe(
            &self,
            kind: TriggerKind,
            _handler: crate::guidance::triggers::TriggerHandler,
        ) -> Subscription {
            let cancelled = self.cancelled.clone();
            Subscription::new(
                kind,
                Box::new(move || {
                    cancelled.fetch_add(1, Ordering::SeqCst);
                }),
            )
        }
    }

    struct FakeCapture;

    #[async_trait]
    impl ScreenCapture for FakeCapture {
        async fn capture(&self) -> WaypostResult<CapturedFrame> {
            Ok(test_frame(0))
        }
    }

    struct FailingCapture;

    #[async_trait]
    impl ScreenCapture for FailingCapture {
        async fn capture(&self) -> WaypostResult<CapturedFrame> {
            Err(WaypostError::Capture("permission denied".into()))
        }
    }

    #[derive(Default)]
    struct RecordingPresenter {
        highlights: Mutex<Vec<Highlight>>,
        clears: AtomicUsize,
    }

    impl Presenter for RecordingPresenter {
        fn show_highlight(&self, highlight: &Highlight) {
            self.highlights.lock().unwrap().push(highlight.clone());
        }
        fn clear_highlights(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
        fn show_speech_bubble(&self, _bubble: &SpeechBubble) {}
        fn dismiss_speech_bubble(&self) {}
    }

    /// A small PNG with `padding` junk bytes appended: same pixels (so the
    /// fingerprints match) but a controllable encoded-size delta.
    fn test_frame(padding: usize) -> CapturedFrame {
        let img = image::RgbImage::from_pixel(64, 64, image::Rgb([30, 90, 160]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes.extend(std::iter::repeat(0u8).take(padding));
        CapturedFrame {
            bytes,
            meta: crate::perception::types::FrameMeta {
                monitor_index: 0,
                scale_factor: 1.0,
                physical_width: 64,
                physical_height: 64,
            },
        }
    }

    fn registry_with(provider: Arc<ScriptedProvider>) -> Arc<AsyncMutex<ProviderRegistry>> {
        let mut registry = ProviderRegistry::new("scripted".into());
        registry.register(provider);
        Arc::new(AsyncMutex::new(registry))
    }

    fn session_with(
        provider: Arc<ScriptedProvider>,
        capture: Arc<dyn ScreenCapture>,
        presenter: Arc<RecordingPresenter>,
    ) -> GuidanceSession {
        GuidanceSession::new(
            registry_with(provider),
            capture,
            None,
            presenter,
            DetectionConfig::default(),
            AccessibilityConfig::default(),
        )
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_task_message_runs_first_cycle_with_ai_highlight() {
        let provider = ScriptedProvider::new(&[
            r#"Click the View tab. {"target":{"text":"View","type":"tab"},"coordinates":{"x":400,"y":120}}"#,
        ]);
        let presenter = Arc::new(RecordingPresenter::default());
        let session = session_with(provider.clone(), Arc::new(FakeCapture), presenter.clone());

        let reply = session
            .process_user_message("How do I freeze the top row in Excel?")
            .await
            .unwrap();

        assert_eq!(reply, "Click the View tab.");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(
            session.current_goal_text().as_deref(),
            Some("How do I freeze the top row in Excel?")
        );

        // No accessibility finder configured: the highlight must carry the
        // model's coordinates tagged as AI.
        let highlights = presenter.highlights.lock().unwrap();
        assert_eq!(highlights.len(), 1);
        assert_eq!((highlights[0].x, highlights[0].y), (400.0, 120.0));
        assert_eq!(
            highlights[0].source,
            crate::guidance::resolver::CoordinateSource::Ai
        );
    }

    #[tokio::test]
    async fn test_greeting_never_touches_goal_state() {
        let provider = ScriptedProvider::new(&[]);
        let session = session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        let reply = session.process_user_message("hi").await.unwrap();
        assert!(!reply.is_empty());
        assert!(session.current_goal_text().is_none());
        // Chat-role fallback resolves to the scripted provider, whose script
        // is empty, so the canned reply is used and that one failed call is
        // the only model traffic.
        assert!(provider.call_count() <= 1);
    }

    #[tokio::test]
    async fn test_manual_check_without_goal_is_noop() {
        let provider = ScriptedProvider::new(&[]);
        let session = session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        assert!(session.trigger_manual_check().await.unwrap().is_none());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_completion_clears_goal_and_presentation() {
        let provider = ScriptedProvider::new(&[
            r#"Click the View tab. {"target":{"text":"View","type":"tab"}}"#,
            "Done! You created the file.",
        ]);
        let presenter = Arc::new(RecordingPresenter::default());
        let session = session_with(provider.clone(), Arc::new(FakeCapture), presenter.clone());

        session
            .process_user_message("Help me create a new file")
            .await
            .unwrap();
        let reply = session.trigger_manual_check().await.unwrap().unwrap();

        assert!(reply.contains("Done! You created the file."));
        assert!(reply.contains(CELEBRATION));
        assert!(session.current_goal_text().is_none());
        assert!(!session.is_active());
        // Completed goals leave no highlight behind.
        assert!(presenter.clears.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_small_byte_delta_skips_model_call() {
        let provider = ScriptedProvider::new(&["Click the View tab."]);
        let session = session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 1);

        let reply = session.handle_background_signal(test_frame(200)).await;
        assert!(reply.is_none());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_large_byte_delta_triggers_prefixed_guidance() {
        let provider = ScriptedProvider::new(&[
            "Click the View tab.",
            r#"Close the update dialog first. {"target":{"text":"Close","type":"button"}}"#,
        ]);
        let session = session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();

        let reply = session
            .handle_background_signal(test_frame(20_000))
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 2);
        assert!(reply.starts_with(SCREEN_CHANGED_PREFIX));
        assert!(reply.contains("Close the update dialog first."));
    }

    #[tokio::test]
    async fn test_background_duplicate_guidance_is_suppressed() {
        let provider = ScriptedProvider::new(&[
            "Click the View tab.",
            // Cosmetically different, same instruction after normalization.
            "Click the \"View\" tab!!",
        ]);
        let session = session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();

        let reply = session.handle_background_signal(test_frame(20_000)).await;
        assert_eq!(provider.call_count(), 2);
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn test_overlapping_manual_checks_issue_one_model_call() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = ScriptedProvider::gated(
            &["Click the View tab.", "Click the Freeze Panes button."],
            gate.clone(),
        );
        let presenter = Arc::new(RecordingPresenter::default());
        let session = Arc::new(session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            presenter,
        ));

        gate.add_permits(1);
        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        assert_eq!(provider.call_count(), 1);

        // First check blocks inside the provider; the overlapping one must
        // short-circuit on the busy guard instead of queueing a second call.
        let first = tokio::spawn({
            let session = session.clone();
            async move { session.trigger_manual_check().await }
        });
        tokio::task::yield_now().await;
        while provider.call_count() < 2 {
            tokio::task::yield_now().await;
        }

        let second = session.trigger_manual_check().await.unwrap();
        assert!(second.is_none());
        assert_eq!(provider.call_count(), 2);

        gate.add_permits(1);
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.as_deref(), Some("Click the Freeze Panes button."));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_reset_mid_flight_discards_stale_response() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = ScriptedProvider::gated(
            &["Click the View tab.", "Click the Freeze Panes button."],
            gate.clone(),
        );
        let session = Arc::new(session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        ));

        gate.add_permits(1);
        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();

        let in_flight = tokio::spawn({
            let session = session.clone();
            async move { session.trigger_manual_check().await }
        });
        while provider.call_count() < 2 {
            tokio::task::yield_now().await;
        }

        session.reset();
        assert!(session.current_goal_text().is_none());

        gate.add_permits(1);
        let result = in_flight.await.unwrap().unwrap();
        // The response landed after reset: dropped, session stays idle.
        assert!(result.is_none());
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_reset_releases_trigger_subscriptions() {
        let provider = ScriptedProvider::new(&["Click the View tab."]);
        let session = Arc::new(session_with(
            provider,
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        ));
        let cancelled = Arc::new(AtomicUsize::new(0));
        session.attach_triggers(&CountingSource {
            cancelled: cancelled.clone(),
        });

        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);

        session.reset();
        // One cancel per trigger kind: hotkey, click, window-shown.
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_completion_releases_trigger_subscriptions() {
        let provider = ScriptedProvider::new(&[
            r#"Click the View tab. {"target":{"text":"View","type":"tab"}}"#,
            "Done! You created the file.",
        ]);
        let session = Arc::new(session_with(
            provider,
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        ));
        let cancelled = Arc::new(AtomicUsize::new(0));
        session.attach_triggers(&CountingSource {
            cancelled: cancelled.clone(),
        });

        session
            .process_user_message("Help me create a new file")
            .await
            .unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);

        session.trigger_manual_check().await.unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let provider = ScriptedProvider::new(&["Click the View tab."]);
        let session = session_with(
            provider,
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        session.reset();
        session.reset();
        assert!(!session.is_active());
    }

    #[tokio::test]
    async fn test_capture_failure_degrades_to_apology() {
        let provider = ScriptedProvider::new(&["unused"]);
        let session = session_with(
            provider.clone(),
            Arc::new(FailingCapture),
            Arc::new(RecordingPresenter::default()),
        );

        let reply = session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        assert_eq!(reply, CAPTURE_APOLOGY);
        assert_eq!(provider.call_count(), 0);
        // The goal survives so the user can just ask again.
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_model_error_keeps_goal_for_retry() {
        let provider = ScriptedProvider::new(&[]);
        let session = session_with(
            provider,
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        let reply = session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        assert_eq!(reply, MODEL_APOLOGY);
        assert!(session.is_active());

        // A later manual check is not blocked by the failed cycle.
        let retry = session.trigger_manual_check().await.unwrap();
        assert_eq!(retry.as_deref(), Some(MODEL_APOLOGY));
    }

    #[tokio::test]
    async fn test_busy_reply_is_recorded_in_transcript() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let provider = ScriptedProvider::gated(&["Click the View tab."], gate.clone());
        let session = Arc::new(session_with(
            provider.clone(),
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        ));

        // Park the first cycle inside the provider call.
        let first = tokio::spawn({
            let session = session.clone();
            async move { session.process_user_message("Help me freeze the top row").await }
        });
        while provider.call_count() < 1 {
            tokio::task::yield_now().await;
        }

        let reply = session
            .process_user_message("Help me also sort column B")
            .await
            .unwrap();
        assert_eq!(reply, BUSY_REPLY);

        let transcript = session.transcript();
        let last = transcript.last().unwrap();
        assert_eq!(last.role, "assistant");
        assert_eq!(last.text, BUSY_REPLY);

        gate.add_permits(1);
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_transcript_records_both_sides() {
        let provider = ScriptedProvider::new(&["Click the View tab."]);
        let session = session_with(
            provider,
            Arc::new(FakeCapture),
            Arc::new(RecordingPresenter::default()),
        );

        session
            .process_user_message("Help me freeze the top row")
            .await
            .unwrap();
        let transcript = session.transcript();
        assert_eq!(transcript.len(), 2);
        assert_eq!(transcript[0].role, "user");
        assert_eq!(transcript[1].role, "assistant");
        assert_eq!(transcript[1].text, "Click the View tab.");
    }

    #[test]
    fn test_normalize_guidance() {
        assert_eq!(
            normalize_guidance("Click the \"View\" tab!!"),
            normalize_guidance("click the view tab")
        );
        let long = "a".repeat(200);
        assert_eq!(normalize_guidance(&long).len(), 80);
    }
}
