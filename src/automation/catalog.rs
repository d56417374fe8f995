//! Every script is one set of screens, points and defaults fed to the same engine.
//!
//! Points are in the canonical 1920x1080 landscape layout. Template names are
//! relative to the region folder (`images_tw/`, `images_jp/`).

use super::dispatcher::{DEPLOYMENT_SLOTS, Point};
use super::options::Region;
use crate::matching::SearchRegion;
use std::time::Duration;

/// A template plus the score it needs to count as on screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Screen {
    pub template: &'static str,
    pub threshold: f32,
    /// Where on screen the element can appear; `None` searches the whole frame
    pub region: Option<SearchRegion>,
}

impl Screen {
    pub const fn new(template: &'static str, threshold: f32) -> Self {
        Self {
            template,
            threshold,
            region: None,
        }
    }

    pub const fn within(self, region: SearchRegion) -> Self {
        Self {
            region: Some(region),
            ..self
        }
    }
}

/// Swipe gesture, millisecond duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scroll {
    pub from: Point,
    pub to: Point,
    pub duration_ms: u64,
}

/// A button whose position differs between game servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionPoint {
    pub tw: Point,
    pub jp: Point,
}

impl RegionPoint {
    pub fn on(self, region: Region) -> Point {
        match region {
            Region::Tw => self.tw,
            Region::Jp => self.jp,
        }
    }
}

/// How one battle is fought and left.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleSpec {
    /// Seen when the battle is over
    pub finished: Screen,
    /// Extra taps after every deployment pass
    pub per_cycle_taps: Vec<Point>,
    /// Taps that leave the result screens
    pub exit_taps: Vec<Point>,
    /// Back button that returns to the main menu once the results are gone
    pub back_point: Option<Point>,
}

/// What to do when the stage cannot be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingStage {
    /// Abandon the round as an operational failure
    Fail,
    /// Restart the game to reshuffle the stage list (when allowed), otherwise
    /// back out through `back`; either way the round starts over
    Reroll { back: Point },
}

/// Walking from the main menu to a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryProcedure {
    /// Opens the list the stage is picked from
    pub open: Screen,
    pub long_scroll: Scroll,
    pub short_scroll: Scroll,
    /// Default short-scroll budget when searching for the stage
    pub max_short_scrolls: u32,
    pub stage: Screen,
    /// Tapped in turn after the stage, each waited for
    pub follow_up: Vec<Screen>,
    /// Entered at the start of every round instead of once per run
    pub every_round: bool,
    pub on_missing: MissingStage,
}

/// The "event is over" dialog and the way back out of it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryCheck {
    pub dialog: Screen,
    pub ok_button: Screen,
    pub ok_point: Point,
    pub close_button: Screen,
    /// Leaves the stage preparation screen when the dialog shows up there
    pub back_point: Point,
}

/// Main-map stepping by crown state: stay on a stage until it wears its
/// crown, then move on to the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct CrownStep {
    /// The selected stage is crowned
    pub cleared: Screen,
    /// The stage before it is crowned
    pub previous_cleared: Screen,
    pub next: Scroll,
    pub previous: Scroll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PostBattleHook {
    /// A bonus stage may open after the battle: fight it or dismiss it.
    ExStage {
        prompt: Screen,
        enter_point: Point,
        skip_point: Point,
    },
}

/// Press start on a stage, fight, leave the results.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRound {
    /// Where a new round starts
    pub actionable: Screen,
    pub start_point: Point,
    pub exhausted: Screen,
    /// "Use an item" button on the exhaustion dialog
    pub recover_point: Point,
    pub battle: BattleSpec,
    pub crowns: Option<CrownStep>,
    pub post_battle: Option<PostBattleHook>,
}

/// Clears the party roster before an expedition.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberKick {
    pub member: Screen,
    pub then: Vec<Point>,
}

/// Send an expedition, roll the device clock past its end, collect.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRound {
    pub kick: MemberKick,
    /// Departure confirmation
    pub confirm: Screen,
    /// Tapped while the confirmation has not shown up yet
    pub nudge: Point,
    pub confirm_point: RegionPoint,
    pub confirm_presses: u32,
    /// Default clock advance per round
    pub clock_step: Duration,
    /// Taps through the return screens once the clock has moved
    pub collect_taps: Vec<Point>,
    pub reward: Screen,
    pub reward_point: Point,
}

/// Blind taps, no recognition at all.
#[derive(Debug, Clone, PartialEq)]
pub struct TapRound {
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Round {
    Stage(StageRound),
    Claim(ClaimRound),
    Taps(TapRound),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptVariant {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub round: Round,
    pub entry: Option<EntryProcedure>,
    pub expiry: Option<ExpiryCheck>,
    /// Limited-time events follow the device timezone
    pub event_clock: bool,
    pub default_order: Vec<usize>,
    pub default_max_loops: u32,
    pub default_long_roll_times: u32,
}

impl ScriptVariant {
    /// The device timezone is checked, and put back after the run.
    pub fn uses_clock(&self) -> bool {
        self.event_clock
    }

    /// The device clock is moved forward every round.
    pub fn shifts_clock(&self) -> bool {
        matches!(self.round, Round::Claim(_))
    }
}

const START_FIGHT: Point = (1627, 765);
const RECOVER: Point = (729, 712);
const SKIP_RESULT: Point = (1861, 57);
const MENU_BACK: Point = (85, 1000);

fn every_slot() -> Vec<usize> {
    (0..DEPLOYMENT_SLOTS).collect()
}

fn stage_round(finished: Screen, per_cycle_taps: Vec<Point>, exit_taps: Vec<Point>) -> StageRound {
    StageRound {
        actionable: Screen::new("start_fight_map", 0.7),
        start_point: START_FIGHT,
        exhausted: Screen::new("power_limited", 0.7),
        recover_point: RECOVER,
        battle: BattleSpec {
            finished,
            per_cycle_taps,
            exit_taps,
            back_point: None,
        },
        crowns: None,
        post_battle: None,
    }
}

fn consume() -> ScriptVariant {
    ScriptVariant {
        id: "consume",
        title: "Consume items",
        description: "Replay the current stage until the loop limit, spending energy",
        round: Round::Stage(stage_round(
            Screen::new("start_fight_map", 0.7),
            vec![SKIP_RESULT],
            Vec::new(),
        )),
        entry: None,
        expiry: None,
        event_clock: false,
        default_order: vec![1],
        default_max_loops: 1000,
        default_long_roll_times: 0,
    }
}

fn collect_gold() -> ScriptVariant {
    let stage = StageRound {
        crowns: Some(CrownStep {
            cleared: Screen::new("gold", 0.9),
            previous_cleared: Screen::new("gold_left", 0.9),
            next: Scroll {
                from: (950, 438),
                to: (750, 438),
                duration_ms: 300,
            },
            previous: Scroll {
                from: (950, 438),
                to: (1150, 438),
                duration_ms: 300,
            },
        }),
        ..stage_round(Screen::new("return_map", 0.7), Vec::new(), vec![SKIP_RESULT; 3])
    };
    ScriptVariant {
        id: "collect-gold",
        title: "Gold crowns",
        description: "Crown every main-map stage in turn; start on the second stage of a chapter",
        round: Round::Stage(stage),
        entry: None,
        expiry: None,
        event_clock: false,
        default_order: every_slot(),
        default_max_loops: 48,
        default_long_roll_times: 0,
    }
}

fn collect_zombie() -> ScriptVariant {
    let mut stage = stage_round(Screen::new("return_map", 0.7), Vec::new(), vec![SKIP_RESULT; 3]);
    stage.battle.back_point = Some(MENU_BACK);
    ScriptVariant {
        id: "collect-zombie",
        title: "Zombie outbreaks",
        description: "Clear zombie outbreak stages on the world maps; start on the main menu",
        round: Round::Stage(stage),
        entry: Some(EntryProcedure {
            open: Screen::new("change_map", 0.7),
            // Back to the first world before searching forward
            long_scroll: Scroll {
                from: (300, 438),
                to: (1700, 438),
                duration_ms: 300,
            },
            short_scroll: Scroll {
                from: (950, 438),
                to: (750, 438),
                duration_ms: 300,
            },
            max_short_scrolls: 3,
            stage: Screen::new("zombie_map", 0.7),
            follow_up: vec![Screen::new("start_game", 0.7), Screen::new("zombie_inner", 0.7)],
            every_round: true,
            on_missing: MissingStage::Reroll { back: MENU_BACK },
        }),
        expiry: None,
        event_clock: false,
        default_order: every_slot(),
        default_max_loops: 0,
        default_long_roll_times: 2,
    }
}

fn legend(
    id: &'static str,
    title: &'static str,
    description: &'static str,
    stage: Screen,
) -> ScriptVariant {
    ScriptVariant {
        id,
        title,
        description,
        round: Round::Stage(stage_round(
            Screen::new("return_map", 0.7),
            Vec::new(),
            vec![SKIP_RESULT; 3],
        )),
        entry: Some(EntryProcedure {
            open: Screen::new("start_game", 0.8),
            long_scroll: Scroll {
                from: (1700, 540),
                to: (300, 540),
                duration_ms: 300,
            },
            short_scroll: Scroll {
                from: (1200, 540),
                to: (800, 540),
                duration_ms: 800,
            },
            max_short_scrolls: 30,
            stage,
            follow_up: Vec::new(),
            every_round: false,
            on_missing: MissingStage::Fail,
        }),
        expiry: Some(ExpiryCheck {
            dialog: Screen::new("legend/act_timeout", 0.7),
            ok_button: Screen::new("OK", 0.7),
            ok_point: (1246, 685),
            close_button: Screen::new("X", 0.7),
            back_point: (84, 990),
        }),
        event_clock: true,
        default_order: vec![1, 2, 3, 4, 5, 11],
        default_max_loops: 0,
        default_long_roll_times: 3,
    }
}

fn xp_stage(n: u8) -> ScriptVariant {
    let (id, title, template) = match n {
        1 => ("legend-xp-1", "XP stage 1", "legend/XP_1"),
        2 => ("legend-xp-2", "XP stage 2", "legend/XP_2"),
        3 => ("legend-xp-3", "XP stage 3", "legend/XP_3"),
        _ => ("legend-xp-4", "XP stage 4", "legend/XP_4"),
    };
    legend(
        id,
        title,
        "Farm the limited-time XP legend stage",
        // The stage banners are busy; a strict threshold misses them
        Screen::new(template, 0.6),
    )
}

fn silver_ticket() -> ScriptVariant {
    ScriptVariant {
        default_order: vec![6, 10, 1],
        ..legend(
            "silver-ticket",
            "Silver ticket chance",
            "Farm the silver-ticket chance stage",
            Screen::new("legend/cats_silver_chance", 0.8),
        )
    }
}

fn bohe_ancient() -> ScriptVariant {
    let mut variant = legend(
        "bohe-ancient",
        "Ancient catnip",
        "Farm the ancient catnip stage, optionally clearing its EX stage",
        Screen::new("legend/BoHe_ancient", 0.8),
    );
    if let Round::Stage(stage) = &mut variant.round {
        stage.post_battle = Some(PostBattleHook::ExStage {
            prompt: Screen::new("legend/BoHe_aEXpart", 0.7),
            enter_point: (729, 703),
            skip_point: (1189, 712),
        });
    }
    variant
}

fn gamatoto() -> ScriptVariant {
    ScriptVariant {
        id: "gamatoto",
        title: "Gamatoto expeditions",
        description: "Send Gamatoto out, move the device clock, collect; start on his screen",
        round: Round::Claim(ClaimRound {
            kick: MemberKick {
                member: Screen::new("member", 0.7),
                then: vec![(385, 747), (712, 773), (712, 773)],
            },
            // The departure dialog sits in the lower middle of the screen
            confirm: Screen::new("YES", 0.8).within(SearchRegion::new(400, 560, 700, 360)),
            nudge: (1852, 155),
            confirm_point: RegionPoint {
                tw: (685, 730),
                jp: (723, 740),
            },
            confirm_presses: 2,
            clock_step: Duration::from_secs(24 * 60 * 60),
            collect_taps: vec![
                (1600, 146),
                (1600, 155),
                (1600, 155),
                (1600, 155),
                (1600, 155),
                (1600, 155),
            ],
            reward: Screen::new("rego", 0.5),
            reward_point: (1450, 155),
        }),
        entry: None,
        expiry: None,
        event_clock: false,
        default_order: Vec::new(),
        default_max_loops: 1000,
        default_long_roll_times: 0,
    }
}

fn capsule_draw() -> ScriptVariant {
    ScriptVariant {
        id: "capsule-draw",
        title: "Capsule draws",
        description: "Keep pressing the draw / OK button; open the capsule page first",
        round: Round::Taps(TapRound {
            points: vec![(1565, 906)],
        }),
        entry: None,
        expiry: None,
        event_clock: false,
        default_order: Vec::new(),
        default_max_loops: 0,
        default_long_roll_times: 0,
    }
}

pub fn all() -> Vec<ScriptVariant> {
    vec![
        consume(),
        collect_gold(),
        collect_zombie(),
        xp_stage(1),
        xp_stage(2),
        xp_stage(3),
        xp_stage(4),
        silver_ticket(),
        bohe_ancient(),
        gamatoto(),
        capsule_draw(),
    ]
}

pub fn find(id: &str) -> Option<ScriptVariant> {
    all().into_iter().find(|v| v.id == id)
}
