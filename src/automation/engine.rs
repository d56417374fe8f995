// The one state machine every script runs on. A script only contributes data
// (screens, points, defaults) and picks one of three round shapes.

use super::EngineError;
use super::cancel::CancelFlag;
use super::catalog::{
    BattleSpec, ClaimRound, CrownStep, EntryProcedure, MissingStage, PostBattleHook, Round,
    Screen, Scroll, ScriptVariant, StageRound, TapRound,
};
use super::dispatcher::{ActionDispatcher, Point};
use super::options::RunOptions;
use super::recovery::{ClockControl, ClockStatus, RecoveryError, Replenisher, Unmanaged};
use super::state::{RunOutcome, RunStatus, ScriptRunState, format_elapsed};
use crate::bridge::AutomationBridge;
use crate::capture::FrameSource;
use crate::logging::RunLog;
use crate::matching::{Match, Matcher, TemplateKey, Threshold};
use std::time::{Duration, Instant};

pub type EngineResult<T> = Result<T, EngineError>;

pub const DEFAULT_FAILURE_LIMIT: u32 = 10;

/// Every wait the engine performs. All of them are cancellable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timings {
    pub poll: Duration,
    pub actionable_timeout: Duration,
    pub after_start: Duration,
    pub after_recover: Duration,
    pub expiry_check: Duration,
    pub dialog_settle: Duration,
    pub back_to_menu: Duration,
    pub enter_event: Duration,
    pub follow_up_timeout: Duration,
    pub scroll_settle: Duration,
    pub battle_cycle: Duration,
    pub battle_timeout: Duration,
    pub exit_tap_gap: Duration,
    pub after_exit: Duration,
    pub tap_gap: Duration,
    pub quick_gap: Duration,
    pub claim_wait: Duration,
    pub reward_settle: Duration,
    pub failure_backoff: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(500),
            actionable_timeout: Duration::from_secs(15),
            after_start: Duration::from_millis(500),
            after_recover: Duration::from_secs(1),
            expiry_check: Duration::from_secs(1),
            dialog_settle: Duration::from_secs(2),
            back_to_menu: Duration::from_secs(3),
            enter_event: Duration::from_secs(3),
            follow_up_timeout: Duration::from_secs(5),
            scroll_settle: Duration::from_millis(500),
            battle_cycle: Duration::from_millis(300),
            battle_timeout: Duration::from_secs(600),
            exit_tap_gap: Duration::from_millis(300),
            after_exit: Duration::from_secs(1),
            tap_gap: Duration::from_millis(250),
            quick_gap: Duration::from_millis(50),
            claim_wait: Duration::from_secs(10),
            reward_settle: Duration::from_secs(2),
            failure_backoff: Duration::from_secs(1),
        }
    }
}

impl Timings {
    /// Every pause set to `step`, timeouts a few steps long.
    pub fn uniform(step: Duration) -> Self {
        Self {
            poll: step,
            actionable_timeout: step * 5,
            after_start: step,
            after_recover: step,
            expiry_check: step,
            dialog_settle: step,
            back_to_menu: step,
            enter_event: step,
            follow_up_timeout: step * 5,
            scroll_settle: step,
            battle_cycle: step,
            battle_timeout: step * 50,
            exit_tap_gap: step,
            after_exit: step,
            tap_gap: step,
            quick_gap: step,
            claim_wait: step * 5,
            reward_settle: step,
            failure_backoff: step,
        }
    }
}

/// Result of one pass through the loop body.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// The round did what it is counted for
    Advanced,
    /// Something was recovered or rearranged; start over without counting
    Retry,
    /// Nothing more can be done
    Stop(String),
}

pub struct Engine<B, F, M> {
    variant: ScriptVariant,
    options: RunOptions,
    dispatcher: ActionDispatcher<B>,
    frames: F,
    matcher: M,
    replenisher: Box<dyn Replenisher>,
    clock: Box<dyn ClockControl>,
    state: ScriptRunState,
    log: RunLog,
    timings: Timings,
    failure_limit: u32,
}

impl<B, F, M> Engine<B, F, M>
where
    B: AutomationBridge,
    F: FrameSource,
    M: Matcher,
{
    pub fn new(
        variant: ScriptVariant,
        options: RunOptions,
        dispatcher: ActionDispatcher<B>,
        frames: F,
        matcher: M,
        replenisher: Box<dyn Replenisher>,
    ) -> Self {
        Self {
            variant,
            options,
            dispatcher,
            frames,
            matcher,
            replenisher,
            clock: Box::new(Unmanaged),
            state: ScriptRunState::new(CancelFlag::new()),
            log: RunLog::silent(),
            timings: Timings::default(),
            failure_limit: DEFAULT_FAILURE_LIMIT,
        }
    }

    pub fn with_clock(mut self, clock: Box<dyn ClockControl>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.state = ScriptRunState::new(cancel);
        self
    }

    pub fn with_log(mut self, log: RunLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    /// Consecutive operational failures tolerated before the run is failed.
    pub fn with_failure_limit(mut self, limit: u32) -> Self {
        self.failure_limit = limit;
        self
    }

    pub async fn run(mut self) -> RunOutcome {
        self.banner();
        let (status, message) = self.drive().await;
        let outcome = self.state.finish(status, message);
        match outcome.status {
            RunStatus::Completed => self.log.line(format!(
                "Finished the configured {} round(s), script stopped.",
                outcome.iterations
            )),
            RunStatus::Stopped => self.log.line(format!(
                "Script stopped: {}",
                outcome.message.as_deref().unwrap_or("no reason given")
            )),
            RunStatus::Failed => self.log.line(format!(
                "Script failed: {}",
                outcome.message.as_deref().unwrap_or("unknown error")
            )),
        }
        outcome
    }

    fn banner(&self) {
        let limit = match self.options.max_loops {
            0 => "unlimited".to_string(),
            n => n.to_string(),
        };
        self.log.line(format!(
            "Script '{}' ({}) started.",
            self.variant.title, self.variant.id
        ));
        self.log.line(format!(
            "Server: {}, rounds: {limit}, package: {}",
            self.options.region,
            self.options.region.package()
        ));
        self.log.line(format!("Options: {}", self.options.describe()));
    }

    fn round_header(&self) {
        self.log.line("-".repeat(30));
        self.log
            .line(format!("Round {} starting", self.state.iterations + 1));
        self.log
            .line(format!("Running for {}", format_elapsed(self.state.elapsed())));
    }

    /// Blind tap rounds run too fast for a per-round narrative.
    fn narrated(&self) -> bool {
        !matches!(self.variant.round, Round::Taps(_))
    }

    /// The stage is walked to once per run, and again after a restart.
    fn entered_once(&self) -> bool {
        self.variant.entry.as_ref().is_some_and(|e| !e.every_round)
    }

    async fn drive(&mut self) -> (RunStatus, Option<String>) {
        if self.entered_once() {
            match self.enter_from_menu().await {
                Ok(Some(Step::Stop(message))) => return (RunStatus::Stopped, Some(message)),
                Ok(_) => {}
                Err(EngineError::Cancelled) => return stopped_on_request(),
                Err(e) if e.is_fatal() => return (RunStatus::Failed, Some(e.to_string())),
                Err(e) => {
                    log::warn!("Entering the event failed: {e}");
                    self.log
                        .line(format!("Could not enter the event ({e}), continuing"));
                }
            }
        }

        let mut failures = 0;
        loop {
            if self.state.cancel.is_cancelled() {
                return stopped_on_request();
            }
            if self.state.limit_reached(self.options.max_loops) {
                return (RunStatus::Completed, None);
            }
            if self.narrated() {
                self.round_header();
            }

            match self.iteration().await {
                Ok(Step::Advanced) | Ok(Step::Retry) => failures = 0,
                Ok(Step::Stop(message)) => return (RunStatus::Stopped, Some(message)),
                Err(EngineError::Cancelled) => return stopped_on_request(),
                Err(e) if e.is_fatal() => {
                    log::error!("Run aborted: {e}");
                    return (RunStatus::Failed, Some(e.to_string()));
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("Round abandoned ({failures} in a row): {e}");
                    self.log.line(format!("Round abandoned: {e}"));
                    if failures > self.failure_limit {
                        return (
                            RunStatus::Failed,
                            Some(format!("{failures} consecutive failed rounds, last: {e}")),
                        );
                    }
                    if self.pause(self.timings.failure_backoff).await.is_err() {
                        return stopped_on_request();
                    }
                }
            }
        }
    }

    async fn iteration(&mut self) -> EngineResult<Step> {
        let step = match &self.variant.round {
            Round::Stage(stage) => self.stage_round(stage).await?,
            Round::Claim(claim) => self.claim_round(claim).await?,
            Round::Taps(taps) => self.tap_round(taps).await?,
        };
        if step != Step::Advanced {
            return Ok(step);
        }

        self.state.iterations += 1;
        if self.narrated() {
            self.log
                .line(format!("Round {} finished", self.state.iterations));
        }
        match self.check_expiry(false).await? {
            Some(Step::Stop(message)) => Ok(Step::Stop(message)),
            _ => Ok(Step::Advanced),
        }
    }

    async fn stage_round(&self, stage: &StageRound) -> EngineResult<Step> {
        if self.variant.entry.as_ref().is_some_and(|e| e.every_round)
            && let Some(step) = self.enter_from_menu().await?
        {
            return Ok(step);
        }
        let crowns = stage
            .crowns
            .as_ref()
            .filter(|_| self.options.collect_all_gold_enabled);
        if let Some(crowns) = crowns
            && let Some(step) = self.step_by_crowns(crowns).await?
        {
            return Ok(step);
        }

        let actionable = stage.actionable;
        let timeout = self.timings.actionable_timeout;
        if !self.wait_for(&actionable, timeout).await? {
            log::warn!("{} not seen within {timeout:?}", actionable.template);
            self.log
                .line("Stage screen not detected, pressing start anyway");
        }
        self.press_start(stage).await?;

        if let Some(step) = self.check_exhaustion(stage).await? {
            return Ok(step);
        }
        if let Some(step) = self.check_expiry(true).await? {
            return Ok(step);
        }

        self.fight(&stage.battle).await?;
        self.post_battle(stage).await?;
        for &point in &stage.battle.exit_taps {
            self.tap(point).await?;
            self.pause(self.timings.exit_tap_gap).await?;
        }
        self.pause(self.timings.after_exit).await?;
        if let Some(back) = stage.battle.back_point {
            self.tap(back).await?;
            self.pause(self.timings.back_to_menu).await?;
        }

        if crowns.is_some() {
            // Counted once the crown shows up
            self.log.line("Battle over, checking the crown");
            return Ok(Step::Retry);
        }
        Ok(Step::Advanced)
    }

    /// `Some` when the map had to move instead of fighting.
    async fn step_by_crowns(&self, crowns: &CrownStep) -> EngineResult<Option<Step>> {
        if !self.visible(&crowns.previous_cleared).await? {
            self.log
                .line("Previous stage has no crown yet, going back to it");
            self.scroll(&crowns.previous).await?;
            return Ok(Some(Step::Retry));
        }
        if self.visible(&crowns.cleared).await? {
            self.log.line("Stage crowned, moving to the next one");
            self.scroll(&crowns.next).await?;
            return Ok(Some(Step::Advanced));
        }
        Ok(None)
    }

    async fn press_start(&self, stage: &StageRound) -> EngineResult<()> {
        let (x, y) = stage.start_point;
        self.dispatcher.press_and_release(x, y).await?;
        self.pause(self.timings.after_start).await
    }

    /// Exhaustion dialog after pressing start. `None` means the battle is on.
    async fn check_exhaustion(&self, stage: &StageRound) -> EngineResult<Option<Step>> {
        if !self.visible(&stage.exhausted).await? {
            return Ok(None);
        }
        self.log.line("Out of energy");
        let use_item = self.options.use_power_recover_enabled;
        let refresh = self.options.refresh_power_enabled;
        if !use_item && !refresh {
            return Ok(Some(Step::Stop(
                "Out of energy and both item recovery and restart refresh are disabled"
                    .to_string(),
            )));
        }
        if use_item {
            self.log.line("Using an energy item");
            self.tap(stage.recover_point).await?;
            self.pause(self.timings.after_recover).await?;
            self.press_start(stage).await?;
            if !self.visible(&stage.exhausted).await? {
                return Ok(None);
            }
            if !refresh {
                return Ok(Some(Step::Stop(
                    "Out of energy and no energy items left".to_string(),
                )));
            }
        }

        self.log.line("Restarting the game to refresh energy");
        self.replenisher.replenish().await?;
        if self.entered_once()
            && let Some(step) = self.enter_from_menu().await?
        {
            return Ok(Some(step));
        }
        Ok(Some(Step::Retry))
    }

    /// The event-ended dialog. `before_battle` means it covers the stage
    /// preparation screen, which has to be backed out of as well.
    async fn check_expiry(&self, before_battle: bool) -> EngineResult<Option<Step>> {
        let Some(expiry) = &self.variant.expiry else {
            return Ok(None);
        };
        self.pause(self.timings.expiry_check).await?;
        if !self.visible(&expiry.dialog).await? {
            return Ok(None);
        }
        self.log
            .line("The event has ended, going back to the main menu");

        if self.visible(&expiry.ok_button).await? {
            self.tap(expiry.ok_point).await?;
        }
        self.pause(self.timings.dialog_settle).await?;
        self.tap_if_visible(&expiry.close_button).await?;
        if before_battle {
            self.tap(expiry.back_point).await?;
        }
        self.pause(self.timings.back_to_menu).await?;
        self.tap_if_visible(&expiry.close_button).await?;

        if let Some(step) = self.enter_from_menu().await? {
            return Ok(Some(step));
        }
        Ok(Some(Step::Retry))
    }

    /// Clock check followed by the walk to the stage. `Some` when the round
    /// cannot go on from here.
    async fn enter_from_menu(&self) -> EngineResult<Option<Step>> {
        if let Some(step) = self.align_clock().await? {
            return Ok(Some(step));
        }
        self.enter_event().await
    }

    async fn align_clock(&self) -> EngineResult<Option<Step>> {
        let allow_change = self.options.change_timezone_enabled;
        match self.clock.ensure_aligned(allow_change).await {
            Ok(ClockStatus::Aligned) => Ok(None),
            Ok(ClockStatus::Changed { from, to }) => {
                self.log
                    .line(format!("Device timezone changed from {from} to {to}"));
                Ok(None)
            }
            Ok(ClockStatus::Misaligned { current, target }) => Ok(Some(Step::Stop(format!(
                "Device timezone is {current} but the event needs {target}; \
                 enable change_timezone_enabled or change it by hand"
            )))),
            Err(RecoveryError::Cancelled) => Err(EngineError::Cancelled),
            Err(e) => Ok(Some(Step::Stop(format!(
                "Could not change the device timezone: {e}"
            )))),
        }
    }

    async fn enter_event(&self) -> EngineResult<Option<Step>> {
        let Some(entry) = &self.variant.entry else {
            return Ok(None);
        };
        let Some(open) = self.look(&entry.open).await?.center() else {
            return Ok(Some(Step::Stop(
                "Main menu not detected, cannot reach the stage".to_string(),
            )));
        };
        self.tap(open).await?;
        self.pause(self.timings.enter_event).await?;

        for _ in 0..self.options.long_roll_times {
            self.scroll(&entry.long_scroll).await?;
        }
        let budget = self.options.stage_search_scrolls;
        for attempt in 0..=budget {
            if let Some(stage) = self.look(&entry.stage).await?.center() {
                self.log.line("Stage found, entering");
                self.tap(stage).await?;
                self.pause(self.timings.enter_event).await?;
                return self.follow_up(entry).await;
            }
            if attempt < budget {
                self.scroll(&entry.short_scroll).await?;
            }
        }

        match entry.on_missing {
            MissingStage::Fail => Err(EngineError::StageNotFound {
                template: entry.stage.template.to_string(),
                scrolls: budget,
            }),
            MissingStage::Reroll { back } => {
                if self.options.refresh_zombie_enabled {
                    self.log
                        .line("Stage not found, restarting the game to reshuffle the maps");
                    self.replenisher.replenish().await?;
                } else {
                    self.log.line("Stage not found, back to the main menu");
                    self.tap(back).await?;
                    self.pause(self.timings.back_to_menu).await?;
                }
                Ok(Some(Step::Retry))
            }
        }
    }

    /// The screens between the stage and its start button.
    async fn follow_up(&self, entry: &EntryProcedure) -> EngineResult<Option<Step>> {
        let timeout = self.timings.follow_up_timeout;
        for screen in &entry.follow_up {
            if let Some(point) = self.locate_within(screen, timeout).await? {
                self.tap(point).await?;
                self.pause(self.timings.enter_event).await?;
                continue;
            }
            log::warn!("{} not seen within {timeout:?}", screen.template);
            return match entry.on_missing {
                MissingStage::Fail => Err(EngineError::StageNotFound {
                    template: screen.template.to_string(),
                    scrolls: 0,
                }),
                MissingStage::Reroll { back } => {
                    self.log
                        .line(format!("{} did not open, backing out", screen.template));
                    self.tap(back).await?;
                    self.pause(self.timings.back_to_menu).await?;
                    Ok(Some(Step::Retry))
                }
            };
        }
        Ok(None)
    }

    /// Deploy until the battle-over screen shows up.
    async fn fight(&self, battle: &BattleSpec) -> EngineResult<()> {
        let started = Instant::now();
        loop {
            self.dispatcher
                .fight_sequence_tap(&self.options.position_order)
                .await?;
            for &point in &battle.per_cycle_taps {
                self.tap(point).await?;
            }
            self.pause(self.timings.battle_cycle).await?;
            if self.visible(&battle.finished).await? {
                return Ok(());
            }
            if started.elapsed() >= self.timings.battle_timeout {
                return Err(EngineError::BattleTimeout(self.timings.battle_timeout));
            }
        }
    }

    async fn post_battle(&self, stage: &StageRound) -> EngineResult<()> {
        let Some(hook) = &stage.post_battle else {
            return Ok(());
        };
        match hook {
            PostBattleHook::ExStage {
                prompt,
                enter_point,
                skip_point,
            } => {
                if !self.visible(prompt).await? {
                    return Ok(());
                }
                if self.options.enter_ex_stage_enabled {
                    self.log.line("EX stage opened, fighting it");
                    self.tap(*enter_point).await?;
                    self.fight(&stage.battle).await
                } else {
                    self.log.line("EX stage opened, skipping it");
                    self.tap(*skip_point).await
                }
            }
        }
    }

    /// Send the expedition off, move the clock past its end, collect.
    async fn claim_round(&self, claim: &ClaimRound) -> EngineResult<Step> {
        let wait = self.timings.claim_wait;
        if self.options.kill_members_enabled
            && self.state.iterations % 2 == 0
            && let Some(member) = self.look(&claim.kick.member).await?.center()
        {
            self.log.line("Clearing the expedition party");
            self.tap(member).await?;
            self.pause(self.timings.tap_gap).await?;
            for &point in &claim.kick.then {
                self.tap(point).await?;
                self.pause(self.timings.tap_gap).await?;
            }
        }

        if self.nudge_until(&claim.confirm, claim.nudge, wait).await? {
            let point = claim.confirm_point.on(self.options.region);
            for _ in 0..claim.confirm_presses {
                self.tap(point).await?;
                self.pause(self.timings.tap_gap).await?;
            }
        } else {
            log::warn!("{} not seen within {wait:?}", claim.confirm.template);
            self.log.line("Departure confirmation not seen, going on");
        }

        self.clock.advance(self.options.clock_step).await?;
        self.log.line(format!(
            "Device clock moved forward {}",
            format_elapsed(self.options.clock_step)
        ));
        for &point in &claim.collect_taps {
            self.tap(point).await?;
            self.pause(self.timings.quick_gap).await?;
        }
        self.pause(self.timings.reward_settle).await?;

        if self
            .nudge_until(&claim.reward, claim.reward_point, wait)
            .await?
        {
            self.tap(claim.reward_point).await?;
        } else {
            log::warn!("{} not seen within {wait:?}", claim.reward.template);
            self.log.line("Reward screen not seen, going on");
        }
        Ok(Step::Advanced)
    }

    async fn tap_round(&self, taps: &TapRound) -> EngineResult<Step> {
        for &point in &taps.points {
            self.tap(point).await?;
            self.pause(self.timings.tap_gap).await?;
        }
        Ok(Step::Advanced)
    }

    async fn look(&self, screen: &Screen) -> EngineResult<Match> {
        let Some(frame) = self.frames.capture().await? else {
            return Ok(Match::NotFound { best: 0.0 });
        };
        let key = TemplateKey::new(screen.template, self.options.region.folder());
        let threshold = Threshold::new(screen.threshold);
        Ok(self.matcher.find(&frame, &key, threshold, screen.region)?)
    }

    async fn visible(&self, screen: &Screen) -> EngineResult<bool> {
        Ok(self.look(screen).await?.is_found())
    }

    /// Poll until `screen` is seen or `timeout` passes.
    async fn wait_for(&self, screen: &Screen, timeout: Duration) -> EngineResult<bool> {
        Ok(self.locate_within(screen, timeout).await?.is_some())
    }

    async fn locate_within(
        &self,
        screen: &Screen,
        timeout: Duration,
    ) -> EngineResult<Option<Point>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.state.cancel.check()?;
            if let Some(point) = self.look(screen).await?.center() {
                return Ok(Some(point));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            self.pause(self.timings.poll).await?;
        }
    }

    /// Like [`wait_for`](Self::wait_for), tapping `nudge` after every miss.
    async fn nudge_until(
        &self,
        screen: &Screen,
        nudge: Point,
        timeout: Duration,
    ) -> EngineResult<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.visible(screen).await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.tap(nudge).await?;
            self.pause(self.timings.tap_gap).await?;
        }
    }

    async fn pause(&self, duration: Duration) -> EngineResult<()> {
        Ok(self.state.cancel.sleep(duration).await?)
    }

    async fn tap(&self, (x, y): Point) -> EngineResult<()> {
        Ok(self.dispatcher.tap(x, y).await?)
    }

    async fn tap_if_visible(&self, screen: &Screen) -> EngineResult<bool> {
        match self.look(screen).await?.center() {
            Some(point) => {
                self.tap(point).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scroll(&self, scroll: &Scroll) -> EngineResult<()> {
        let (x1, y1) = scroll.from;
        let (x2, y2) = scroll.to;
        self.dispatcher
            .swipe(x1, y1, x2, y2, scroll.duration_ms)
            .await?;
        self.pause(self.timings.scroll_settle).await
    }
}

fn stopped_on_request() -> (RunStatus, Option<String>) {
    (RunStatus::Stopped, Some("stop requested".to_string()))
}
