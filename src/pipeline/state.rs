//! Element state management

/// Lifecycle state of a sink session.
///
/// States are ordered; a session only ever moves one step at a time, either
/// up (`Null` → `Playing`) or down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ElementState {
    /// Nothing allocated
    #[default]
    Null,
    /// Plane allocator open, no connection
    Ready,
    /// Connected (or capture-only), frames accepted but held
    Paused,
    /// Frames flow
    Playing,
}

impl ElementState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &ElementState) -> bool {
        self == target || Transition::between(*self, *target).is_some()
    }

    pub fn description(&self) -> &'static str {
        match self {
            ElementState::Null => "Null",
            ElementState::Ready => "Ready",
            ElementState::Paused => "Paused",
            ElementState::Playing => "Playing",
        }
    }

    /// Check if frames are accepted in this state
    pub fn is_active(&self) -> bool {
        matches!(self, ElementState::Paused | ElementState::Playing)
    }

    fn step_towards(&self, target: ElementState) -> Option<ElementState> {
        use ElementState::*;
        let next = match (self < &target, self) {
            (true, Null) => Ready,
            (true, Ready) => Paused,
            (true, Paused) => Playing,
            (false, Playing) => Paused,
            (false, Paused) => Ready,
            (false, Ready) => Null,
            _ => return None,
        };
        (*self != target).then_some(next)
    }
}

impl std::fmt::Display for ElementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// The six single-step state changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    NullToReady,
    ReadyToPaused,
    PausedToPlaying,
    PlayingToPaused,
    PausedToReady,
    ReadyToNull,
}

impl Transition {
    pub fn between(from: ElementState, to: ElementState) -> Option<Transition> {
        use ElementState::*;
        match (from, to) {
            (Null, Ready) => Some(Transition::NullToReady),
            (Ready, Paused) => Some(Transition::ReadyToPaused),
            (Paused, Playing) => Some(Transition::PausedToPlaying),
            (Playing, Paused) => Some(Transition::PlayingToPaused),
            (Paused, Ready) => Some(Transition::PausedToReady),
            (Ready, Null) => Some(Transition::ReadyToNull),
            _ => None,
        }
    }

    pub fn from_state(&self) -> ElementState {
        match self {
            Transition::NullToReady => ElementState::Null,
            Transition::ReadyToPaused | Transition::ReadyToNull => ElementState::Ready,
            Transition::PausedToPlaying | Transition::PausedToReady => ElementState::Paused,
            Transition::PlayingToPaused => ElementState::Playing,
        }
    }

    pub fn to_state(&self) -> ElementState {
        match self {
            Transition::NullToReady | Transition::PausedToReady => ElementState::Ready,
            Transition::ReadyToPaused | Transition::PlayingToPaused => ElementState::Paused,
            Transition::PausedToPlaying => ElementState::Playing,
            Transition::ReadyToNull => ElementState::Null,
        }
    }

    /// Single-step transitions leading from `from` to `to`, in order.
    pub fn path(from: ElementState, to: ElementState) -> Vec<Transition> {
        let mut steps = Vec::new();
        let mut state = from;
        while let Some(next) = state.step_towards(to) {
            if let Some(step) = Transition::between(state, next) {
                steps.push(step);
            }
            state = next;
        }
        steps
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from_state(), self.to_state())
    }
}

/// Result of applying a transition.
///
/// `pass_to_default` asks the surrounding framework to run its own default
/// handling after the sink's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub success: bool,
    pub pass_to_default: bool,
}

impl TransitionOutcome {
    pub fn done() -> Self {
        Self {
            success: true,
            pass_to_default: false,
        }
    }

    pub fn chained() -> Self {
        Self {
            success: true,
            pass_to_default: true,
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            pass_to_default: false,
        }
    }
}
