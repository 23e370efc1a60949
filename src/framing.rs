//! Framing-style finite state machine for the layout and encode stages.
//!
//! When the user selects `auto` framing, this FSM walks the per-segment
//! signals produced by layout analysis and decides the framing state for
//! each segment. Every transition is recorded in the style transition
//! journal, which travels inside the encoding plan and tells the assembly
//! stage which transition effect to use at each boundary.
//!
//! `duo_pip` and `cinematic_solo` are unreachable except by explicit user
//! request events; face-count and screen-share signals never produce them.

use serde::{Deserialize, Serialize};

/// Framing state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingState {
    Solo,
    DuoSplit,
    DuoPip,
    ScreenShare,
    CinematicSolo,
}

impl FramingState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Solo => "solo",
            Self::DuoSplit => "duo_split",
            Self::DuoPip => "duo_pip",
            Self::ScreenShare => "screen_share",
            Self::CinematicSolo => "cinematic_solo",
        }
    }
}

/// Events driven by per-segment layout data or explicit user requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingEvent {
    FaceCountIncrease,
    FaceCountDecrease,
    ScreenShareDetected,
    ScreenShareEnded,
    /// Explicit user request; the only path into `DuoPip`.
    PipRequested,
    /// Explicit user request; the only path into `CinematicSolo`.
    CinematicRequested,
}

/// The transition table. A `(state, event)` pair absent from the table means
/// the event does not change the state.
static TRANSITIONS: &[(FramingState, FramingEvent, FramingState)] = {
    use FramingEvent as E;
    use FramingState as S;
    &[
        (S::Solo, E::FaceCountIncrease, S::DuoSplit),
        (S::Solo, E::ScreenShareDetected, S::ScreenShare),
        (S::Solo, E::PipRequested, S::DuoPip),
        (S::Solo, E::CinematicRequested, S::CinematicSolo),
        (S::DuoSplit, E::FaceCountDecrease, S::Solo),
        (S::DuoSplit, E::ScreenShareDetected, S::ScreenShare),
        (S::DuoSplit, E::PipRequested, S::DuoPip),
        (S::DuoPip, E::FaceCountDecrease, S::Solo),
        (S::DuoPip, E::ScreenShareDetected, S::ScreenShare),
        (S::ScreenShare, E::ScreenShareEnded, S::Solo),
        (S::ScreenShare, E::PipRequested, S::DuoPip),
        (S::CinematicSolo, E::FaceCountIncrease, S::DuoSplit),
        (S::CinematicSolo, E::ScreenShareDetected, S::ScreenShare),
    ]
};

/// Evaluate one event against the table. Returns `None` when the event does
/// not change the state. Pure; never suspends.
#[must_use]
pub fn apply(state: FramingState, event: FramingEvent) -> Option<FramingState> {
    TRANSITIONS
        .iter()
        .find(|(from, ev, _)| *from == state && *ev == event)
        .map(|(_, _, to)| *to)
}

/// Why a journal entry exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// The framing state changed mid-moment.
    StyleChange,
    /// A boundary between moments; drives the longer cross-fade.
    NarrativeBoundary,
}

/// Transition effect the assembly stage applies at a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionEffect {
    Cut,
    CrossFade,
    LongCrossFade,
}

/// One entry in the style transition journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleTransition {
    /// Offset into the reel timeline, in seconds.
    pub timestamp: f64,
    pub from_state: FramingState,
    pub to_state: FramingState,
    /// The event or boundary that caused the transition.
    pub trigger: String,
    pub effect: TransitionEffect,
    pub kind: TransitionKind,
}

/// A per-segment signal extracted from layout analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentSignal {
    /// Segment start offset in seconds.
    pub start: f64,
    pub face_count: u8,
    pub screen_share: bool,
    /// True when this segment begins a new moment.
    pub moment_boundary: bool,
}

/// The framing FSM plus its journal.
#[derive(Debug, Clone)]
pub struct FramingFsm {
    state: FramingState,
    journal: Vec<StyleTransition>,
}

impl FramingFsm {
    #[must_use]
    pub fn new(initial: FramingState) -> Self {
        Self {
            state: initial,
            journal: Vec::new(),
        }
    }

    #[must_use]
    pub const fn state(&self) -> FramingState {
        self.state
    }

    /// Consume the FSM, yielding the journal.
    #[must_use]
    pub fn into_journal(self) -> Vec<StyleTransition> {
        self.journal
    }

    /// Feed one event at the given timeline offset. No-op events produce no
    /// journal entry.
    pub fn feed(&mut self, at: f64, event: FramingEvent) {
        if let Some(next) = apply(self.state, event) {
            self.journal.push(StyleTransition {
                timestamp: at,
                from_state: self.state,
                to_state: next,
                trigger: format!("{event:?}"),
                effect: TransitionEffect::CrossFade,
                kind: TransitionKind::StyleChange,
            });
            self.state = next;
        }
    }

    /// Record a mandatory narrative boundary between moments. The state does
    /// not change; the entry drives the longer cross-fade at assembly.
    pub fn narrative_boundary(&mut self, at: f64) {
        self.journal.push(StyleTransition {
            timestamp: at,
            from_state: self.state,
            to_state: self.state,
            trigger: "moment boundary".to_string(),
            effect: TransitionEffect::LongCrossFade,
            kind: TransitionKind::NarrativeBoundary,
        });
    }
}

/// Drive the FSM over ordered segment signals and return the framing state
/// chosen for each segment plus the journal.
///
/// Narrative boundaries are recorded for every segment that begins a new
/// moment (mandatory in multi-moment runs). Pure; never suspends.
#[must_use]
pub fn drive(signals: &[SegmentSignal], initial: FramingState) -> (Vec<FramingState>, Vec<StyleTransition>) {
    let mut fsm = FramingFsm::new(initial);
    let mut states = Vec::with_capacity(signals.len());
    let mut prev_faces: u8 = 1;
    let mut prev_share = false;

    for (i, signal) in signals.iter().enumerate() {
        if i > 0 && signal.moment_boundary {
            fsm.narrative_boundary(signal.start);
        }
        if signal.screen_share && !prev_share {
            fsm.feed(signal.start, FramingEvent::ScreenShareDetected);
        } else if !signal.screen_share && prev_share {
            fsm.feed(signal.start, FramingEvent::ScreenShareEnded);
        }
        if signal.face_count > prev_faces {
            fsm.feed(signal.start, FramingEvent::FaceCountIncrease);
        } else if signal.face_count < prev_faces {
            fsm.feed(signal.start, FramingEvent::FaceCountDecrease);
        }
        prev_faces = signal.face_count;
        prev_share = signal.screen_share;
        states.push(fsm.state());
    }

    (states, fsm.into_journal())
}
