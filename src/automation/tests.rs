// Tests for the automation engine and its collaborators
// Focus: loop skeleton outcomes, recovery branches, cancellation, options, timezone scope

#[cfg(test)]
mod test_support {
    use super::super::recovery::{ClockControl, ClockStatus, RecoveryResult, Replenisher};
    use crate::adb::{AdbError, AdbResult, CommandChannel};
    use crate::bridge::{AutomationBridge, BridgeError, BridgeResult};
    use crate::capture::{CaptureResult, Frame, FrameSource};
    use crate::matching::{
        Match, MatchError, MatchResult, Matcher, SearchRegion, TemplateKey, Threshold,
    };
    use async_trait::async_trait;
    use image::RgbImage;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    pub const START: (u32, u32) = (1627, 765);
    pub const RECOVER: (u32, u32) = (729, 712);

    #[derive(Debug, Clone, PartialEq)]
    pub enum Action {
        Tap(u32, u32),
        Swipe(u32, u32, u32, u32),
        Relaunch(String),
    }

    /// Records every input; optionally refuses all of it.
    #[derive(Default)]
    pub struct FakeBridge {
        pub actions: Mutex<Vec<Action>>,
        pub quits: AtomicUsize,
        pub offline: bool,
    }

    impl FakeBridge {
        pub fn offline() -> Self {
            Self {
                offline: true,
                ..Self::default()
            }
        }

        pub fn actions(&self) -> Vec<Action> {
            self.actions.lock().unwrap().clone()
        }

        pub fn taps_at(&self, point: (u32, u32)) -> usize {
            self.actions()
                .iter()
                .filter(|a| **a == Action::Tap(point.0, point.1))
                .count()
        }

        pub fn swipes(&self) -> usize {
            self.actions()
                .iter()
                .filter(|a| matches!(a, Action::Swipe(..)))
                .count()
        }

        fn record(&self, action: Action) -> BridgeResult<()> {
            if self.offline {
                return Err(BridgeError::Unavailable {
                    reason: "device unplugged".to_string(),
                });
            }
            self.actions.lock().unwrap().push(action);
            Ok(())
        }
    }

    impl AutomationBridge for FakeBridge {
        async fn capture_frame(&self) -> BridgeResult<RgbImage> {
            Ok(RgbImage::new(8, 8))
        }

        async fn tap(&self, x: u32, y: u32) -> BridgeResult<()> {
            self.record(Action::Tap(x, y))
        }

        async fn swipe(
            &self,
            x1: u32,
            y1: u32,
            x2: u32,
            y2: u32,
            _duration: Duration,
        ) -> BridgeResult<()> {
            self.record(Action::Swipe(x1, y1, x2, y2))
        }

        async fn relaunch_app(&self, package: &str, _activity: &str) -> BridgeResult<()> {
            self.record(Action::Relaunch(package.to_string()))
        }

        async fn quit(&self) -> BridgeResult<()> {
            self.quits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct StillFrames;

    impl FrameSource for StillFrames {
        async fn capture(&self) -> CaptureResult<Option<Frame>> {
            Ok(Some(Frame::new(RgbImage::new(8, 8))))
        }
    }

    type Rule = Box<dyn Fn(&str, usize) -> bool>;

    /// Answers "is `template` on screen" from a rule over the template name and
    /// how many times the start button has been pressed so far.
    pub struct ScriptedMatcher {
        bridge: Arc<FakeBridge>,
        rule: Rule,
        pub broken: bool,
        /// Every search region asked for, by template name
        pub regions: Arc<Mutex<Vec<(String, Option<SearchRegion>)>>>,
    }

    impl ScriptedMatcher {
        pub fn new(
            bridge: Arc<FakeBridge>,
            rule: impl Fn(&str, usize) -> bool + 'static,
        ) -> Self {
            Self {
                bridge,
                rule: Box::new(rule),
                broken: false,
                regions: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl Matcher for ScriptedMatcher {
        fn find(
            &self,
            _frame: &Frame,
            key: &TemplateKey,
            threshold: Threshold,
            region: Option<SearchRegion>,
        ) -> MatchResult<Match> {
            self.regions
                .lock()
                .unwrap()
                .push((key.name.clone(), region));
            if self.broken {
                return Err(MatchError::TemplateLargerThanFrame {
                    template: (10, 10),
                    frame: (8, 8),
                });
            }
            let starts = self.bridge.taps_at(START);
            Ok(if (self.rule)(&key.name, starts) {
                Match::from_score((100, 100), (20, 20), 1.0, threshold)
            } else {
                Match::NotFound { best: 0.1 }
            })
        }
    }

    #[derive(Default)]
    pub struct CountingReplenisher {
        pub calls: AtomicUsize,
    }

    #[async_trait(?Send)]
    impl Replenisher for Arc<CountingReplenisher> {
        async fn replenish(&self) -> RecoveryResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct FixedClock {
        pub status: ClockStatus,
        pub advanced: Mutex<Vec<Duration>>,
    }

    impl FixedClock {
        pub fn new(status: ClockStatus) -> Arc<Self> {
            Arc::new(Self {
                status,
                advanced: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait(?Send)]
    impl ClockControl for Arc<FixedClock> {
        async fn ensure_aligned(&self, allow_change: bool) -> RecoveryResult<ClockStatus> {
            Ok(match &self.status {
                ClockStatus::Misaligned { current, target } if allow_change => {
                    ClockStatus::Changed {
                        from: current.clone(),
                        to: target.clone(),
                    }
                }
                other => other.clone(),
            })
        }

        async fn advance(&self, by: Duration) -> RecoveryResult<()> {
            self.advanced.lock().unwrap().push(by);
            Ok(())
        }
    }

    /// A device whose only state is its timezone and its clock.
    pub struct FakeDevice {
        pub timezone: Mutex<String>,
        pub epoch: Mutex<u64>,
        pub commands: Mutex<Vec<String>>,
        /// Async shell calls time out; the blocking path keeps working
        pub async_down: AtomicBool,
        /// `date @N` is accepted but the clock stays put
        pub clock_locked: bool,
    }

    impl FakeDevice {
        pub fn new(timezone: &str) -> Self {
            Self {
                timezone: Mutex::new(timezone.to_string()),
                epoch: Mutex::new(1_700_000_000),
                commands: Mutex::new(Vec::new()),
                async_down: AtomicBool::new(false),
                clock_locked: false,
            }
        }

        pub fn timezone(&self) -> String {
            self.timezone.lock().unwrap().clone()
        }

        pub fn epoch(&self) -> u64 {
            *self.epoch.lock().unwrap()
        }

        fn handle(&self, args: &[&str]) -> AdbResult<String> {
            self.commands.lock().unwrap().push(args.join(" "));
            match args {
                ["getprop", "persist.sys.timezone"] => Ok(format!("{}\n", self.timezone())),
                ["service", "call", "alarm", "3", "s16", tz]
                | ["setprop", "persist.sys.timezone", tz] => {
                    *self.timezone.lock().unwrap() = tz.to_string();
                    Ok("Result: Parcel(00000000    '....')\n".to_string())
                }
                ["date", "+%z"] => Ok("+0800\n".to_string()),
                ["date", "+%s"] => Ok(format!("{}\n", self.epoch())),
                ["date", set] => {
                    if let Some(secs) = set.strip_prefix('@').and_then(|s| s.parse().ok())
                        && !self.clock_locked
                    {
                        *self.epoch.lock().unwrap() = secs;
                    }
                    Ok(String::new())
                }
                _ => Ok(String::new()),
            }
        }
    }

    #[async_trait]
    impl CommandChannel for FakeDevice {
        async fn shell(&self, args: &[&str]) -> AdbResult<String> {
            if self.async_down.load(Ordering::SeqCst) {
                return Err(AdbError::Timeout {
                    duration: Duration::from_secs(5),
                    description: args.join(" "),
                });
            }
            self.handle(args)
        }

        fn shell_blocking(&self, args: &[&str]) -> AdbResult<String> {
            self.handle(args)
        }
    }
}

#[cfg(test)]
mod engine_tests {
    use super::super::cancel::CancelFlag;
    use super::super::catalog;
    use super::super::dispatcher::ActionDispatcher;
    use super::super::engine::{Engine, Timings};
    use super::super::options::{OptionMap, OptionValue, RunOptions};
    use super::super::recovery::ClockStatus;
    use super::super::state::{RunOutcome, RunStatus};
    use super::test_support::*;
    use crate::matching::SearchRegion;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::{Duration, Instant};

    const SKIP: (u32, u32) = (1861, 57);
    const MENU_BACK: (u32, u32) = (85, 1000);
    /// Where ScriptedMatcher reports every match
    const CENTER: (u32, u32) = (110, 110);

    fn options_for(
        variant: &catalog::ScriptVariant,
        pairs: &[(&str, OptionValue)],
    ) -> RunOptions {
        let map: OptionMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        RunOptions::resolve(&map, variant).expect("valid options")
    }

    fn engine(
        variant: catalog::ScriptVariant,
        options: RunOptions,
        bridge: &Arc<FakeBridge>,
        matcher: ScriptedMatcher,
        replenisher: &Arc<CountingReplenisher>,
    ) -> Engine<FakeBridge, StillFrames, ScriptedMatcher> {
        Engine::new(
            variant,
            options,
            ActionDispatcher::new(bridge.clone()),
            StillFrames,
            matcher,
            Box::new(replenisher.clone()),
        )
        .with_timings(Timings::uniform(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_loop_limit_three_completes() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(3))]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| name == "start_fight_map");
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(bridge.taps_at(START), 3, "One start press per round");
        assert_eq!(replenisher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_with_recovery_disabled_stops() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(
            &variant,
            &[
                ("refresh_power_enabled", OptionValue::Bool(false)),
                ("use_power_recover_enabled", OptionValue::Bool(false)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        // Out of energy from the second start press on
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, starts| match name {
            "start_fight_map" => true,
            "power_limited" => starts >= 2,
            _ => false,
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(outcome.iterations, 1, "Round 2 never completes");
        assert_eq!(bridge.taps_at(START), 2);
        assert_eq!(replenisher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.taps_at(RECOVER), 0, "No item used");
        assert!(
            !bridge
                .actions()
                .iter()
                .any(|a| matches!(a, Action::Relaunch(_))),
            "No restart"
        );
        assert!(outcome.message.unwrap_or_default().contains("Out of energy"));
    }

    #[tokio::test]
    async fn test_exhaustion_uses_item_then_presses_start_again() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(
            &variant,
            &[
                ("max_loops", OptionValue::Int(2)),
                ("use_power_recover_enabled", OptionValue::Bool(true)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, starts| match name {
            "start_fight_map" => true,
            "power_limited" => starts == 2,
            _ => false,
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(bridge.taps_at(START), 3, "The exhausted press is repeated");
        assert_eq!(bridge.taps_at(RECOVER), 1);
        assert_eq!(replenisher.calls.load(Ordering::SeqCst), 0, "Item wins over restart");
    }

    #[tokio::test]
    async fn test_no_items_left_and_refresh_disabled_stops() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(
            &variant,
            &[
                ("use_power_recover_enabled", OptionValue::Bool(true)),
                ("refresh_power_enabled", OptionValue::Bool(false)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            matches!(name, "start_fight_map" | "power_limited")
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(bridge.taps_at(RECOVER), 1);
        assert_eq!(bridge.taps_at(START), 2, "Start pressed again after the item");
        assert!(outcome.message.unwrap_or_default().contains("no energy items"));
    }

    #[tokio::test]
    async fn test_exhaustion_replenishes_when_refresh_enabled() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(1))]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, starts| match name {
            "start_fight_map" => true,
            "power_limited" => starts == 1,
            _ => false,
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(replenisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_long_wait() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::default());
        // Never actionable: the engine sits in its poll sleep
        let matcher = ScriptedMatcher::new(bridge.clone(), |_, _| false);
        let replenisher = Arc::new(CountingReplenisher::default());
        let cancel = CancelFlag::new();
        let timings = Timings {
            poll: Duration::from_secs(5),
            actionable_timeout: Duration::from_secs(60),
            ..Timings::default()
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let outcome = engine(variant, options, &bridge, matcher, &replenisher)
            .with_timings(timings)
            .with_cancel(cancel)
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "Cancel took {:?}, the 5s poll sleep was not interrupted",
            started.elapsed()
        );
        assert_eq!(outcome.iterations, 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_touches_nothing() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |_, _| true);
        let replenisher = Arc::new(CountingReplenisher::default());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let outcome = engine(variant, options, &bridge, matcher, &replenisher)
            .with_cancel(cancel)
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(bridge.actions().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_bridge_fails_run() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::offline());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| name == "start_fight_map");
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.unwrap_or_default().contains("unavailable"));
    }

    #[tokio::test]
    async fn test_repeated_operational_failures_fail_run() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::default());
        let mut matcher = ScriptedMatcher::new(bridge.clone(), |_, _| true);
        matcher.broken = true;
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher)
            .with_failure_limit(2)
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.unwrap_or_default().contains("3 consecutive"));
    }

    #[tokio::test]
    async fn test_legend_entry_and_exit_taps() {
        let variant = catalog::find("legend-xp-1").expect("xp 1");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(1))]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            matches!(name, "start_game" | "legend/XP_1" | "start_fight_map" | "return_map")
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(bridge.swipes(), 3, "Default long scroll count, stage visible at once");
        assert_eq!(bridge.taps_at((1861, 57)), 3, "Three taps through the result screens");
        // start_game and the stage banner are tapped at their match centre
        assert_eq!(bridge.taps_at((110, 110)), 2);
    }

    #[tokio::test]
    async fn test_misaligned_clock_without_change_stops() {
        let variant = catalog::find("silver-ticket").expect("silver");
        let options = options_for(
            &variant,
            &[("change_timezone_enabled", OptionValue::Bool(false))],
        );
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |_, _| true);
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher)
            .with_clock(Box::new(FixedClock::new(ClockStatus::Misaligned {
                current: "Asia/Taipei".to_string(),
                target: "Asia/Tokyo".to_string(),
            })))
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(bridge.actions().is_empty(), "Nothing is tapped before the clock is right");
    }

    #[tokio::test]
    async fn test_expired_event_reenters() {
        let variant = catalog::find("legend-xp-2").expect("xp 2");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(1))]);
        let bridge = Arc::new(FakeBridge::default());
        // The event dialog shows after the first start press only
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, starts| match name {
            "legend/act_timeout" => starts == 1,
            "OK" => starts == 1,
            "start_game" | "legend/XP_2" | "start_fight_map" | "return_map" => true,
            _ => false,
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(bridge.taps_at((1246, 685)), 1, "Dialog confirmed");
        assert_eq!(bridge.taps_at((84, 990)), 1, "Backed out of the preparation screen");
        assert_eq!(bridge.taps_at(START), 2);
        assert_eq!(bridge.swipes(), 6, "Entry procedure ran twice");
    }

    #[tokio::test]
    async fn test_ex_stage_skipped_when_disabled() {
        let variant = catalog::find("bohe-ancient").expect("bohe");
        let options = options_for(
            &variant,
            &[
                ("max_loops", OptionValue::Int(1)),
                ("enter_ex_stage_enabled", OptionValue::Bool(false)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            name != "legend/act_timeout" && name != "power_limited"
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(bridge.taps_at((1189, 712)), 1);
        assert_eq!(bridge.taps_at((729, 703)), 0);
    }

    #[tokio::test]
    async fn test_ex_stage_fought_when_enabled() {
        let variant = catalog::find("bohe-ancient").expect("bohe");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(1))]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            name != "legend/act_timeout" && name != "power_limited"
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(bridge.taps_at((729, 703)), 1);
        assert_eq!(bridge.taps_at((1189, 712)), 0);
    }

    fn swipes_to(bridge: &FakeBridge, to: (u32, u32)) -> usize {
        bridge
            .actions()
            .iter()
            .filter(|a| matches!(a, Action::Swipe(_, _, x, y) if (*x, *y) == to))
            .count()
    }

    #[tokio::test]
    async fn test_gold_crowns_step_back_then_forward() {
        let variant = catalog::find("collect-gold").expect("gold");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(1))]);
        let bridge = Arc::new(FakeBridge::default());
        let seen = bridge.clone();
        // The previous stage shows its crown once the map moved back; the
        // current one earns its crown in the first battle
        let matcher = ScriptedMatcher::new(bridge.clone(), move |name, starts| match name {
            "gold_left" => seen.swipes() >= 1,
            "gold" => starts >= 1,
            "start_fight_map" | "return_map" => true,
            _ => false,
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1, "Counted once the crown appeared");
        assert_eq!(swipes_to(&bridge, (1150, 438)), 1, "Back to the uncrowned stage");
        assert_eq!(swipes_to(&bridge, (750, 438)), 1, "On to the next stage");
        assert_eq!(bridge.taps_at(START), 1, "One battle");
        assert_eq!(bridge.taps_at(SKIP), 3);
    }

    #[tokio::test]
    async fn test_gold_without_crown_collection_counts_battles() {
        let variant = catalog::find("collect-gold").expect("gold");
        let options = options_for(
            &variant,
            &[
                ("max_loops", OptionValue::Int(2)),
                ("collect_all_gold_enabled", OptionValue::Bool(false)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            matches!(name, "start_fight_map" | "return_map" | "gold" | "gold_left")
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(bridge.taps_at(START), 2);
        assert_eq!(bridge.swipes(), 0, "The map never moves");
    }

    fn zombie_screens(name: &str) -> bool {
        matches!(
            name,
            "change_map" | "start_game" | "start_fight_map" | "return_map"
        )
    }

    #[tokio::test]
    async fn test_zombie_round_enters_from_menu_and_backs_out() {
        let variant = catalog::find("collect-zombie").expect("zombie");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(1))]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            zombie_screens(name) || matches!(name, "zombie_map" | "zombie_inner")
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(bridge.swipes(), 2, "Two long scrolls, stage visible at once");
        // change_map, the outbreak, start_game and the inner stage
        assert_eq!(bridge.taps_at(CENTER), 4);
        assert_eq!(bridge.taps_at(SKIP), 3);
        assert_eq!(bridge.taps_at(MENU_BACK), 1, "Back to the menu after the results");
    }

    #[tokio::test]
    async fn test_missing_zombie_stage_restarts_the_game() {
        let variant = catalog::find("collect-zombie").expect("zombie");
        let options = options_for(
            &variant,
            &[
                ("max_loops", OptionValue::Int(1)),
                ("max_times", OptionValue::Int(1)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let replenisher = Arc::new(CountingReplenisher::default());
        let restarts = replenisher.clone();
        // Outbreaks only show up on a freshly started game
        let matcher = ScriptedMatcher::new(bridge.clone(), move |name, _| match name {
            "zombie_map" => restarts.calls.load(Ordering::SeqCst) >= 1,
            "zombie_inner" => true,
            other => zombie_screens(other),
        });

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(replenisher.calls.load(Ordering::SeqCst), 1);
        // 2 long + 1 short before the restart, 2 long after
        assert_eq!(bridge.swipes(), 5);
        assert_eq!(bridge.taps_at(START), 1);
    }

    #[tokio::test]
    async fn test_unopened_zombie_stage_backs_out_without_restart() {
        let variant = catalog::find("collect-zombie").expect("zombie");
        let options = options_for(
            &variant,
            &[
                ("max_loops", OptionValue::Int(1)),
                ("refresh_zombie_enabled", OptionValue::Bool(false)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let seen = bridge.clone();
        let matcher = ScriptedMatcher::new(bridge.clone(), move |name, _| match name {
            "zombie_map" => true,
            "zombie_inner" => seen.taps_at(MENU_BACK) >= 1,
            other => zombie_screens(other),
        });
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(replenisher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(bridge.taps_at(MENU_BACK), 2, "Once for the unopened stage, once after");
    }

    #[tokio::test]
    async fn test_gamatoto_round_moves_the_clock() {
        let variant = catalog::find("gamatoto").expect("gamatoto");
        let options = options_for(
            &variant,
            &[
                ("max_loops", OptionValue::Int(2)),
                ("server", OptionValue::Text("jp".to_string())),
                ("kill_members_enabled", OptionValue::Bool(true)),
            ],
        );
        let bridge = Arc::new(FakeBridge::default());
        let seen = bridge.clone();
        // The confirmation needs one nudge before it shows up
        let matcher = ScriptedMatcher::new(bridge.clone(), move |name, _| match name {
            "YES" => seen.taps_at((1852, 155)) >= 1,
            "member" | "rego" => true,
            _ => false,
        });
        let regions = matcher.regions.clone();
        let replenisher = Arc::new(CountingReplenisher::default());
        let clock = FixedClock::new(ClockStatus::Aligned);

        let outcome = engine(variant, options, &bridge, matcher, &replenisher)
            .with_clock(Box::new(clock.clone()))
            .run()
            .await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.iterations, 2);
        let day = Duration::from_secs(24 * 60 * 60);
        assert_eq!(*clock.advanced.lock().unwrap(), vec![day, day]);
        assert_eq!(bridge.taps_at((1852, 155)), 1);
        assert_eq!(bridge.taps_at((723, 740)), 4, "Two presses per round, jp layout");
        assert_eq!(bridge.taps_at((685, 730)), 0);
        assert_eq!(bridge.taps_at(CENTER), 1, "Party cleared on even rounds only");
        assert_eq!(bridge.taps_at((385, 747)), 1);
        assert_eq!(bridge.taps_at((1450, 155)), 2);
        assert!(
            regions
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == "YES")
                .all(|(_, region)| *region == Some(SearchRegion::new(400, 560, 700, 360))),
            "The confirmation is searched for in its dialog area only"
        );
    }

    #[tokio::test]
    async fn test_gamatoto_without_clock_access_fails() {
        let variant = catalog::find("gamatoto").expect("gamatoto");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |_, _| true);
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.iterations, 0);
        assert!(outcome.message.unwrap_or_default().contains("device clock"));
    }

    #[tokio::test]
    async fn test_capsule_draw_taps_blind() {
        let variant = catalog::find("capsule-draw").expect("draw");
        let options = options_for(&variant, &[("max_loops", OptionValue::Int(3))]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |_, _| false);
        let regions = matcher.regions.clone();
        let replenisher = Arc::new(CountingReplenisher::default());

        let outcome = engine(variant, options, &bridge, matcher, &replenisher).run().await;

        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(bridge.taps_at((1565, 906)), 3);
        assert_eq!(bridge.actions().len(), 3);
        assert!(regions.lock().unwrap().is_empty(), "No screen is ever matched");
    }

    /// Run `engine` and cancel it 50ms in.
    async fn cancelled_soon(
        engine: Engine<FakeBridge, StillFrames, ScriptedMatcher>,
    ) -> (RunOutcome, Duration) {
        let cancel = CancelFlag::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let outcome = engine.with_cancel(cancel).run().await;
        (outcome, started.elapsed())
    }

    #[tokio::test]
    async fn test_cancel_interrupts_battle_cycle_pause() {
        let variant = catalog::find("consume").expect("consume");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::default());
        // Actionable before the start press; the battle never ends
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, starts| {
            name == "start_fight_map" && starts == 0
        });
        let replenisher = Arc::new(CountingReplenisher::default());
        let timings = Timings {
            battle_cycle: Duration::from_secs(5),
            ..Timings::uniform(Duration::from_millis(1))
        };

        let engine = engine(variant, options, &bridge, matcher, &replenisher).with_timings(timings);
        let (outcome, elapsed) = cancelled_soon(engine).await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(elapsed < Duration::from_secs(1), "Cancel took {elapsed:?}");
        assert_eq!(bridge.taps_at(START), 1, "Stopped inside the battle");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_event_entry_pause() {
        let variant = catalog::find("legend-xp-1").expect("xp 1");
        let options = options_for(&variant, &[]);
        let bridge = Arc::new(FakeBridge::default());
        let matcher = ScriptedMatcher::new(bridge.clone(), |name, _| {
            matches!(name, "start_game" | "legend/XP_1")
        });
        let replenisher = Arc::new(CountingReplenisher::default());
        let timings = Timings {
            enter_event: Duration::from_secs(5),
            ..Timings::uniform(Duration::from_millis(1))
        };

        let engine = engine(variant, options, &bridge, matcher, &replenisher).with_timings(timings);
        let (outcome, elapsed) = cancelled_soon(engine).await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert!(elapsed < Duration::from_secs(1), "Cancel took {elapsed:?}");
        assert_eq!(bridge.taps_at(CENTER), 1, "Stopped right after opening the menu");
        assert_eq!(bridge.swipes(), 0);
    }
}

#[cfg(test)]
mod restart_tests {
    use super::super::cancel::CancelFlag;
    use super::super::recovery::{AppRestart, RecoveryError, Replenisher};
    use super::test_support::{Action, FakeBridge};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_restart_relaunches_the_package() {
        let bridge = Arc::new(FakeBridge::default());
        let restart = AppRestart::new(
            bridge.clone(),
            "jp.co.ponos.battlecats",
            "x",
            CancelFlag::new(),
        )
        .with_settle(Duration::from_millis(1));

        restart.replenish().await.expect("restart");

        assert_eq!(
            bridge.actions(),
            vec![Action::Relaunch("jp.co.ponos.battlecats".to_string())]
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_restart_settle() {
        let bridge = Arc::new(FakeBridge::default());
        let cancel = CancelFlag::new();
        let restart = AppRestart::new(
            bridge.clone(),
            "jp.co.ponos.battlecatstw",
            "x",
            cancel.clone(),
        )
        .with_settle(Duration::from_secs(5));
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let result = restart.replenish().await;

        assert!(matches!(result, Err(RecoveryError::Cancelled)), "{result:?}");
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "Cancel took {:?}, the settle wait was not interrupted",
            started.elapsed()
        );
        assert_eq!(bridge.actions().len(), 1, "Relaunched before the wait");
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use super::super::dispatcher::{ActionDispatcher, DeploymentTable};
    use super::test_support::{Action, FakeBridge};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_order_six_ten_one() {
        let bridge = Arc::new(FakeBridge::default());
        let dispatcher = ActionDispatcher::new(bridge.clone());
        let table = DeploymentTable::canonical();

        let sent = dispatcher.fight_sequence_tap(&[6, 10, 1]).await.expect("taps");

        assert_eq!(sent, 3);
        let expected: Vec<Action> = [6, 10, 1]
            .iter()
            .map(|&i| {
                let (x, y) = table.position(i).expect("slot");
                Action::Tap(x, y)
            })
            .collect();
        assert_eq!(bridge.actions(), expected);
    }

    #[tokio::test]
    async fn test_repeats_and_unknown_slots_skipped() {
        let bridge = Arc::new(FakeBridge::default());
        let dispatcher = ActionDispatcher::new(bridge.clone());

        let sent = dispatcher.fight_sequence_tap(&[2, 2, 40, 11]).await.expect("taps");

        assert_eq!(sent, 2);
        assert_eq!(bridge.actions().len(), 2);
    }

    #[test]
    fn test_slot_labels() {
        assert_eq!(DeploymentTable::label(0), "wallet");
        assert_eq!(DeploymentTable::label(7), "cat 7");
        assert_eq!(DeploymentTable::label(11), "cannon");
    }
}

#[cfg(test)]
mod options_tests {
    use super::super::catalog;
    use super::super::options::{
        CaptureMode, OptionMap, OptionValue, OptionsError, Region, RunOptions,
        parse_options_json, parse_override,
    };
    use std::time::Duration;

    fn resolve(json: &str, script: &str) -> Result<RunOptions, OptionsError> {
        let map = parse_options_json(json)?;
        RunOptions::resolve(&map, &catalog::find(script).expect("script"))
    }

    #[test]
    fn test_defaults_per_variant() {
        let consume = resolve("{}", "consume").expect("options");
        assert_eq!(consume.max_loops, 1000);
        assert_eq!(consume.region, Region::Tw);
        assert_eq!(consume.position_order, vec![1]);

        let silver = resolve("{}", "silver-ticket").expect("options");
        assert_eq!(silver.max_loops, 0, "Legend scripts run until stopped");
        assert_eq!(silver.position_order, vec![6, 10, 1]);
        assert!(silver.refresh_power_enabled);
        assert!(!silver.use_power_recover_enabled);
    }

    fn max_loops(json: &str) -> u32 {
        resolve(json, "consume").expect("options").max_loops
    }

    #[test]
    fn test_unparseable_count_means_unlimited() {
        assert_eq!(max_loops(r#"{"max_loops": "lots"}"#), 0);
        assert_eq!(max_loops(r#"{"max_loops": "25"}"#), 25);
        assert_eq!(max_loops(r#"{"max_loops": -3}"#), 0);
    }

    #[test]
    fn test_odd_json_shapes_fall_back_instead_of_failing() {
        assert_eq!(max_loops(r#"{"max_loops": 2.5}"#), 0, "Fractional count");
        assert_eq!(max_loops(r#"{"max_loops": {"n": 3}}"#), 0, "Object count");
        assert_eq!(max_loops(r#"{"max_loops": null}"#), 1000, "null is absent");

        let options = resolve(
            r#"{"position_order": [1.5, 2], "long_roll_times": 1e3, "server": null}"#,
            "silver-ticket",
        )
        .expect("options");
        assert_eq!(options.position_order, vec![6, 10, 1]);
        assert_eq!(options.long_roll_times, 3);
        assert_eq!(options.region, Region::Tw);

        let map = parse_options_json(r#"{"max_loops": 2.5, "x": [true]}"#).expect("json");
        assert_eq!(map["max_loops"], OptionValue::Float(2.5));
        assert_eq!(map["x"].to_string(), "[true]");
    }

    #[test]
    fn test_capture_mode() {
        let mode = |json: &str| resolve(json, "gamatoto").map(|o| o.capture);
        assert_eq!(mode("{}").expect("mode"), CaptureMode::Compat);
        assert_eq!(mode(r#"{"window_title": "MuMu"}"#).expect("mode"), CaptureMode::Fast);
        assert_eq!(
            mode(r#"{"window_title": "MuMu", "run_mod": "兼容"}"#).expect("mode"),
            CaptureMode::Compat
        );
        let fast = r#"{"window_title": "MuMu", "run_mod": "高效（需窗口标题）"}"#;
        assert_eq!(mode(fast).expect("mode"), CaptureMode::Fast);

        let err = mode(r#"{"run_mod": "fast"}"#).unwrap_err();
        assert!(err.to_string().contains("window_title"), "{err}");
        assert!(mode(r#"{"run_mod": "turbo", "window_title": "MuMu"}"#).is_err());
    }

    #[test]
    fn test_farming_script_defaults() {
        let gold = resolve("{}", "collect-gold").expect("options");
        assert_eq!(gold.max_loops, 48);
        assert_eq!(gold.position_order, (0..12).collect::<Vec<_>>());
        assert!(gold.collect_all_gold_enabled);

        let zombie = resolve("{}", "collect-zombie").expect("options");
        assert_eq!(zombie.max_loops, 0);
        assert_eq!(zombie.long_roll_times, 2);
        assert_eq!(zombie.stage_search_scrolls, 3);
        assert!(zombie.refresh_zombie_enabled);
        let zombie = resolve(r#"{"max_times": 6}"#, "collect-zombie").expect("options");
        assert_eq!(zombie.stage_search_scrolls, 6);

        let gamatoto = resolve("{}", "gamatoto").expect("options");
        assert_eq!(gamatoto.max_loops, 1000);
        assert_eq!(gamatoto.clock_step, Duration::from_secs(24 * 60 * 60));
        assert!(!gamatoto.kill_members_enabled);
        let gamatoto = resolve(r#"{"clock_step_minutes": 90}"#, "gamatoto").expect("options");
        assert_eq!(gamatoto.clock_step, Duration::from_secs(90 * 60));

        assert_eq!(resolve("{}", "capsule-draw").expect("options").max_loops, 0);
    }

    #[test]
    fn test_region_labels() {
        let jp = resolve(r#"{"server": "日服"}"#, "consume").expect("options");
        assert_eq!(jp.region, Region::Jp);
        assert_eq!(jp.region.folder(), "images_jp");
        assert_eq!(jp.region.activity(), "jp.co.ponos.battlecats.MyActivity");
        assert!(resolve(r#"{"server": "kr"}"#, "consume").is_err());
    }

    #[test]
    fn test_position_order() {
        let custom = resolve(r#"{"position_order": [3, 0, 11]}"#, "consume").expect("options");
        assert_eq!(custom.position_order, vec![3, 0, 11]);

        let fallback = resolve(r#"{"position_order": "6,10"}"#, "silver-ticket").expect("options");
        assert_eq!(fallback.position_order, vec![6, 10, 1], "Non-list keeps the default");

        let err = resolve(r#"{"position_order": [1, 12]}"#, "consume").unwrap_err();
        assert!(
            matches!(err, OptionsError::InvalidValue { ref name, .. } if name == "position_order")
        );
    }

    #[test]
    fn test_malformed_toggle_fails_fast() {
        let err = resolve(r#"{"refresh_power_enabled": "maybe"}"#, "consume").unwrap_err();
        assert!(err.to_string().contains("refresh_power_enabled"));
        let off = resolve(r#"{"refresh_power_enabled": "off"}"#, "consume").expect("options");
        assert!(!off.refresh_power_enabled);
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(parse_options_json("[1, 2]"), Err(OptionsError::NotAnObject(_))));
        assert!(matches!(parse_options_json("{"), Err(OptionsError::Json(_))));
    }

    #[test]
    fn test_override_shapes() {
        let cases = [
            ("max_loops=5", OptionValue::Int(5)),
            ("refresh_power_enabled=false", OptionValue::Bool(false)),
            ("position_order=6,10,1", OptionValue::List(vec![6, 10, 1])),
            ("position_order=[2]", OptionValue::List(vec![2])),
            ("server=jp", OptionValue::Text("jp".to_string())),
            ("target_timezone=Asia/Tokyo", OptionValue::Text("Asia/Tokyo".to_string())),
        ];
        for (raw, expected) in cases {
            let (_, value) = parse_override(raw).expect(raw);
            assert_eq!(value, expected, "{raw}");
        }
        assert!(parse_override("no-equals").is_err());
        assert!(parse_override("=1").is_err());
    }

    #[test]
    fn test_overrides_merge_into_file_options() {
        let mut map: OptionMap =
            parse_options_json(r#"{"max_loops": 10, "server": "tw"}"#).expect("json");
        let (key, value) = parse_override("max_loops=2").expect("override");
        map.insert(key, value);
        let consume = catalog::find("consume").expect("consume");
        let options = RunOptions::resolve(&map, &consume).expect("options");
        assert_eq!(options.max_loops, 2);
    }
}

#[cfg(test)]
mod clock_tests {
    use super::super::recovery::{
        ClockControl, ClockStatus, DeviceClock, RecoveryError, TargetClock, TimezoneScope,
        format_offset,
    };
    use super::test_support::FakeDevice;
    use crate::adb::CommandChannel;
    use std::sync::Arc;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn clock(device: &Arc<FakeDevice>) -> DeviceClock {
        let channel: Arc<dyn CommandChannel> = device.clone();
        DeviceClock::new(channel)
    }

    #[test]
    fn test_format_offset() {
        assert_eq!(format_offset("+0900").as_deref(), Some("+09:00"));
        assert_eq!(format_offset("-0330").as_deref(), Some("-03:30"));
        assert_eq!(format_offset("0900"), None);
        assert_eq!(format_offset("+09"), None);
    }

    #[tokio::test]
    async fn test_offset_from_device() {
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        assert_eq!(clock(&device).utc_offset().await.expect("offset"), "+08:00");
    }

    #[tokio::test]
    async fn test_scope_restores_on_explicit_release() {
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let scope = TimezoneScope::capture(clock(&device)).await.expect("capture");
        clock(&device).set_timezone("Asia/Tokyo").await.expect("set");
        assert_eq!(device.timezone(), "Asia/Tokyo");

        scope.restore().await.expect("restore");
        assert_eq!(device.timezone(), "Asia/Taipei");
    }

    #[tokio::test]
    async fn test_scope_restores_on_drop() {
        let device = Arc::new(FakeDevice::new("Europe/Berlin"));
        {
            let scope = TimezoneScope::capture(clock(&device)).await.expect("capture");
            assert_eq!(scope.original(), "Europe/Berlin");
            clock(&device).set_timezone("Asia/Tokyo").await.expect("set");
        }
        assert_eq!(device.timezone(), "Europe/Berlin");
    }

    #[tokio::test]
    async fn test_failed_release_still_restores_on_drop() {
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let scope = TimezoneScope::capture(clock(&device)).await.expect("capture");
        clock(&device).set_timezone("Asia/Tokyo").await.expect("set");
        device.async_down.store(true, Ordering::SeqCst);

        assert!(scope.restore().await.is_err());
        assert_eq!(
            device.timezone(),
            "Asia/Taipei",
            "The blocking restore ran after the async one failed"
        );
    }

    #[tokio::test]
    async fn test_untouched_scope_sends_no_set() {
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let scope = TimezoneScope::capture(clock(&device)).await.expect("capture");
        scope.restore().await.expect("restore");
        let commands = device.commands.lock().unwrap().clone();
        assert!(commands.iter().all(|c| c.starts_with("getprop")), "{commands:?}");
    }

    #[tokio::test]
    async fn test_target_clock() {
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let target = TargetClock::new(clock(&device), Some("Asia/Tokyo".to_string()));

        let status = target.ensure_aligned(false).await.expect("check");
        assert!(matches!(status, ClockStatus::Misaligned { .. }));
        assert_eq!(device.timezone(), "Asia/Taipei", "Report only");

        let status = target.ensure_aligned(true).await.expect("align");
        assert_eq!(
            status,
            ClockStatus::Changed {
                from: "Asia/Taipei".to_string(),
                to: "Asia/Tokyo".to_string()
            }
        );
        assert_eq!(target.ensure_aligned(false).await.expect("check"), ClockStatus::Aligned);

        let untargeted = TargetClock::new(clock(&device), None);
        assert_eq!(untargeted.ensure_aligned(false).await.expect("check"), ClockStatus::Aligned);
    }

    #[tokio::test]
    async fn test_clock_advance_and_network_time() {
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let start = device.epoch();
        let target = TargetClock::new(clock(&device), None);

        target.advance(Duration::from_secs(3600)).await.expect("advance");
        assert_eq!(device.epoch(), start + 3600);

        clock(&device).resume_network_time().await.expect("resume");
        let commands = device.commands.lock().unwrap().clone();
        assert!(commands.contains(&"settings put global auto_time 0".to_string()));
        assert_eq!(commands.last().map(String::as_str), Some("settings put global auto_time 1"));
    }

    #[tokio::test]
    async fn test_clock_that_ignores_the_set_is_reported() {
        let device = Arc::new(FakeDevice {
            clock_locked: true,
            ..FakeDevice::new("Asia/Taipei")
        });
        let start = device.epoch();

        let err = clock(&device)
            .advance(Duration::from_secs(60))
            .await
            .unwrap_err();

        match err {
            RecoveryError::ClockNotAdvanced { wanted, actual } => {
                assert_eq!(wanted, start + 60);
                assert_eq!(actual, start);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[cfg(test)]
mod runner_tests {
    use super::super::cancel::CancelFlag;
    use super::super::catalog;
    use super::super::engine::Timings;
    use super::super::options::{OptionMap, OptionValue, RunOptions};
    use super::super::runner::{RunContext, run_variant};
    use super::super::state::{RunStatus, format_elapsed};
    use super::test_support::{FakeBridge, FakeDevice};
    use crate::adb::CommandChannel;
    use crate::logging::RunLog;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    const MISSING_WINDOW: &str = "no window is called this 7f3a";

    fn context(cancel: CancelFlag, lines: &Arc<Mutex<Vec<String>>>) -> RunContext {
        let sink = lines.clone();
        RunContext {
            assets: PathBuf::from("/nonexistent/battlecats-assets"),
            cancel,
            log: RunLog::new(move |line| sink.lock().unwrap().push(line.to_string())),
            timings: Timings::uniform(Duration::from_millis(1)),
        }
    }

    fn options(
        script: &str,
        pairs: &[(&str, OptionValue)],
    ) -> (catalog::ScriptVariant, RunOptions) {
        let variant = catalog::find(script).expect("script");
        let map: OptionMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        let options = RunOptions::resolve(&map, &variant).expect("options");
        (variant, options)
    }

    #[tokio::test]
    async fn test_bridge_released_on_failure() {
        let bridge = Arc::new(FakeBridge::default());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let (variant, options) = options("consume", &[]);

        let context = context(CancelFlag::new(), &lines);

        let outcome = run_variant(bridge.clone(), None, variant, options, context).await;

        assert_eq!(outcome.status, RunStatus::Failed, "Missing template assets are fatal");
        assert!(outcome.message.unwrap_or_default().contains("start_fight_map"));
        assert_eq!(bridge.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bridge_released_on_stop() {
        let bridge = Arc::new(FakeBridge::default());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (variant, options) = options("consume", &[]);

        let context = context(cancel, &lines);

        let outcome = run_variant(bridge.clone(), None, variant, options, context).await;

        assert_eq!(outcome.status, RunStatus::Stopped);
        assert_eq!(bridge.quits.load(Ordering::SeqCst), 1);
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l.contains("started")), "Banner: {lines:?}");
        assert!(lines.last().is_some_and(|l| l.contains("STOPPED")), "{lines:?}");
    }

    #[tokio::test]
    async fn test_bridge_released_when_window_capture_fails() {
        let bridge = Arc::new(FakeBridge::default());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let (variant, options) = options(
            "consume",
            &[("window_title", OptionValue::Text(MISSING_WINDOW.to_string()))],
        );
        let context = context(CancelFlag::new(), &lines);

        let outcome = run_variant(bridge.clone(), None, variant, options, context).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.unwrap_or_default().contains("Window capture"));
        assert_eq!(bridge.quits.load(Ordering::SeqCst), 1);
        assert!(bridge.actions().is_empty());
    }

    #[tokio::test]
    async fn test_compat_mode_ignores_the_window() {
        let bridge = Arc::new(FakeBridge::default());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let (variant, options) = options(
            "consume",
            &[
                ("window_title", OptionValue::Text(MISSING_WINDOW.to_string())),
                ("run_mod", OptionValue::Text("compat".to_string())),
            ],
        );
        let context = context(CancelFlag::new(), &lines);

        let outcome = run_variant(bridge.clone(), None, variant, options, context).await;

        // Frames come from the bridge, so the run gets as far as the assets
        assert_eq!(outcome.status, RunStatus::Failed);
        assert!(outcome.message.unwrap_or_default().contains("start_fight_map"));
    }

    #[tokio::test]
    async fn test_network_time_resumed_after_clock_run() {
        let bridge = Arc::new(FakeBridge::default());
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let (variant, options) = options("gamatoto", &[]);
        let channel: Arc<dyn CommandChannel> = device.clone();
        let context = context(CancelFlag::new(), &lines);

        let outcome = run_variant(bridge.clone(), Some(channel), variant, options, context).await;

        assert_eq!(outcome.status, RunStatus::Failed, "No template assets");
        let commands = device.commands.lock().unwrap().clone();
        assert_eq!(commands, vec!["settings put global auto_time 1".to_string()]);
        assert_eq!(bridge.quits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timezone_restored_after_run() {
        let bridge = Arc::new(FakeBridge::default());
        let device = Arc::new(FakeDevice::new("Asia/Taipei"));
        let lines = Arc::new(Mutex::new(Vec::new()));
        let (variant, options) = options(
            "legend-xp-3",
            &[("target_timezone", OptionValue::Text("Asia/Tokyo".to_string()))],
        );
        let channel: Arc<dyn CommandChannel> = device.clone();

        let context = context(CancelFlag::new(), &lines);

        // The clock is aligned during entry, then the missing assets end the run
        let outcome = run_variant(bridge.clone(), Some(channel), variant, options, context).await;

        assert_eq!(outcome.status, RunStatus::Failed);
        let commands = device.commands.lock().unwrap().clone();
        assert!(
            commands.iter().any(|c| c.ends_with("s16 Asia/Tokyo")),
            "Timezone was changed during the run: {commands:?}"
        );
        assert_eq!(device.timezone(), "Asia/Taipei");
        assert_eq!(bridge.quits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(0)), "0d 00:00:00");
        assert_eq!(format_elapsed(Duration::from_secs(3_723)), "0d 01:02:03");
        assert_eq!(format_elapsed(Duration::from_secs(90_061)), "1d 01:01:01");
    }
}
