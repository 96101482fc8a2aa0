pub use error::EventValidationError;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Display};

pub mod error;

/// Monotonic event time in nanoseconds.
pub type Nanos = u64;

pub type DeviceId = i32;
pub type DisplayId = i32;
pub type KeyCode = i32;
pub type ScanCode = i32;
pub type MetaState = u32;
pub type ButtonState = u32;
pub type EdgeFlags = u32;

/// The built-in display that monitor channels observe.
pub const MAIN_DISPLAY: DisplayId = 0;

pub const MAX_POINTERS: usize = 16;
pub const MAX_POINTER_ID: u8 = 31;

pub const KEYCODE_UNKNOWN: KeyCode = 0;
pub const KEYCODE_HOME: KeyCode = 3;
pub const KEYCODE_ENDCALL: KeyCode = 6;

pub const META_SHIFT_ON: MetaState = 0x01;
pub const META_SHIFT_LEFT_ON: MetaState = 0x40;
pub const META_ALT_ON: MetaState = 0x02;
pub const META_ALT_LEFT_ON: MetaState = 0x10;
pub const META_ALT_RIGHT_ON: MetaState = 0x20;
pub const META_CAPS_LOCK_ON: MetaState = 0x0010_0000;
pub const META_FUNCTION_ON: MetaState = 0x08;

bitflags::bitflags! {
    /// Where an event came from. The low bits carry the device class, which
    /// is what dispatch decisions actually look at; the rest distinguishes
    /// concrete device kinds for logging and diagnostics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Source: u32 {
        const CLASS_BUTTON     = 0x0000_0001;
        const CLASS_POINTER    = 0x0000_0002;
        const CLASS_NAVIGATION = 0x0000_0004;
        const CLASS_POSITION   = 0x0000_0008;
        const CLASS_JOYSTICK   = 0x0000_0010;

        const KEYBOARD    = 0x0000_0100 | Self::CLASS_BUTTON.bits();
        const DPAD        = 0x0000_0200 | Self::CLASS_BUTTON.bits();
        const TOUCHSCREEN = 0x0000_1000 | Self::CLASS_POINTER.bits();
        const MOUSE       = 0x0000_2000 | Self::CLASS_POINTER.bits();
        const STYLUS      = 0x0000_4000 | Self::CLASS_POINTER.bits();
        const TRACKBALL   = 0x0001_0000 | Self::CLASS_NAVIGATION.bits();
        const TOUCHPAD    = 0x0010_0000 | Self::CLASS_POSITION.bits();
        const JOYSTICK    = 0x0100_0000 | Self::CLASS_JOYSTICK.bits();
    }
}

impl Source {
    pub fn is_pointer(self) -> bool {
        self.intersects(Self::CLASS_POINTER)
    }

    /// Sources that may legitimately stream MOVE samples without a gesture.
    pub fn is_streaming(self) -> bool {
        self.intersects(Self::CLASS_JOYSTICK | Self::CLASS_NAVIGATION)
    }
}

bitflags::bitflags! {
    /// Flags attached by the policy during interception. The low half is
    /// reserved for raw flags owned by the reader; the high half is assigned
    /// by the dispatcher and the policy.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PolicyFlags: u32 {
        const SHIFT     = 0x0001;
        const CAPS_LOCK = 0x0002;
        const ALT       = 0x0004;
        const ALT_GR    = 0x0008;
        const FUNCTION  = 0x0010;
        const VIRTUAL   = 0x0020;
        const WAKE      = 0x0040;

        const RAW_MASK  = 0xffff;

        const INJECTED           = 0x0100_0000;
        const TRUSTED            = 0x0200_0000;
        const FILTERED           = 0x0400_0000;
        const DISABLE_KEY_REPEAT = 0x0800_0000;
        const PASS_TO_USER       = 0x4000_0000;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        const CANCELED         = 0x01;
        const LONG_PRESS       = 0x02;
        const FALLBACK         = 0x04;
        const VIRTUAL_HARD_KEY = 0x08;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MotionFlags: u32 {
        const WINDOW_IS_OBSCURED = 0x01;
        const CANCELED           = 0x02;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum KeyAction {
    Down,
    Up,
}

/// Motion actions. Pointer-down / pointer-up carry the index of the pointer
/// that changed within the event's pointer array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Down,
    Up,
    Move,
    Cancel,
    Outside,
    HoverEnter,
    HoverMove,
    HoverExit,
    Scroll,
    PointerDown(u8),
    PointerUp(u8),
}

impl MotionAction {
    /// Index of the pointer the action refers to. Zero for actions that
    /// describe the whole gesture, matching how single-pointer actions are
    /// always stored at index 0.
    pub fn pointer_index(self) -> usize {
        match self {
            MotionAction::PointerDown(i) | MotionAction::PointerUp(i) => i as usize,
            _ => 0,
        }
    }

    pub fn is_hover(self) -> bool {
        matches!(
            self,
            MotionAction::HoverEnter | MotionAction::HoverMove | MotionAction::HoverExit
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ToolType {
    #[default]
    Unknown,
    Finger,
    Stylus,
    Mouse,
    Eraser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerProperties {
    pub id: u8,
    pub tool_type: ToolType,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PointerCoords {
    pub x: f32,
    pub y: f32,
    pub pressure: f32,
    pub size: f32,
}

impl PointerCoords {
    pub fn scaled(self, factor: f32) -> Self {
        PointerCoords {
            x: self.x * factor,
            y: self.y * factor,
            pressure: self.pressure,
            size: self.size,
        }
    }

    pub fn offset(self, dx: f32, dy: f32) -> Self {
        PointerCoords {
            x: self.x + dx,
            y: self.y + dy,
            ..self
        }
    }
}

/// Set of pointer ids, stored as a 32-bit mask. Pointer ids are small by
/// contract (`MAX_POINTER_ID`), so one word always suffices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerIdSet(u32);

impl PointerIdSet {
    pub const fn empty() -> Self {
        PointerIdSet(0)
    }

    pub fn single(id: u8) -> Self {
        let mut set = Self::empty();
        set.insert(id);
        set
    }

    pub fn insert(&mut self, id: u8) {
        debug_assert!(id <= MAX_POINTER_ID);
        self.0 |= 1 << id;
    }

    pub fn remove(&mut self, id: u8) {
        self.0 &= !(1 << id);
    }

    pub fn contains(self, id: u8) -> bool {
        self.0 & (1 << id) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(self, other: Self) -> Self {
        PointerIdSet(self.0 | other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = u8> {
        (0..=MAX_POINTER_ID).filter(move |id| self.contains(*id))
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl Display for PointerIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Key event as reported by the reader, and the payload of injected keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEventArgs {
    pub event_time: Nanos,
    pub device_id: DeviceId,
    pub source: Source,
    pub policy_flags: PolicyFlags,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: KeyCode,
    pub scan_code: ScanCode,
    pub meta_state: MetaState,
    pub repeat_count: u32,
    pub down_time: Nanos,
}

/// Motion event as reported by the reader, and the payload of injected
/// motions.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionEventArgs {
    pub event_time: Nanos,
    pub device_id: DeviceId,
    pub source: Source,
    pub display_id: DisplayId,
    pub policy_flags: PolicyFlags,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub meta_state: MetaState,
    pub button_state: ButtonState,
    pub edge_flags: EdgeFlags,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nanos,
    pub pointer_properties: Vec<PointerProperties>,
    pub pointer_coords: Vec<PointerCoords>,
}

/// One historical sample of an injected motion chain. Samples older than the
/// current event carry their own time and coordinates; everything else is
/// shared with the final event.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionSample {
    pub event_time: Nanos,
    pub pointer_coords: Vec<PointerCoords>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwitchEventArgs {
    pub event_time: Nanos,
    pub switch_values: u32,
    pub switch_mask: u32,
    pub policy_flags: PolicyFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceResetArgs {
    pub event_time: Nanos,
    pub device_id: DeviceId,
}

/// An event handed to `inject`. Motions may carry history, which the
/// dispatcher unrolls into a chain of inbound entries sharing one injection
/// state.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Key(KeyEventArgs),
    Motion {
        args: MotionEventArgs,
        history: Vec<MotionSample>,
    },
}

/// Checks the structural invariants of a motion event: pointer count bounds,
/// pointer id range and uniqueness, and that a pointer-indexed action refers
/// to a real array position.
pub fn validate_motion_event(
    action: MotionAction,
    pointer_properties: &[PointerProperties],
    pointer_coords: &[PointerCoords],
) -> Result<(), EventValidationError> {
    let count = pointer_properties.len();
    if pointer_coords.len() != count {
        return Err(EventValidationError::MismatchedPointerArrays {
            properties: count,
            coords: pointer_coords.len(),
        });
    }
    if count < 1 || count > MAX_POINTERS {
        return Err(EventValidationError::InvalidPointerCount(count));
    }
    let mut seen = PointerIdSet::empty();
    for properties in pointer_properties {
        let id = properties.id;
        if id > MAX_POINTER_ID {
            return Err(EventValidationError::InvalidPointerId(id));
        }
        if seen.contains(id) {
            return Err(EventValidationError::DuplicatePointerId(id));
        }
        seen.insert(id);
    }
    if let MotionAction::PointerDown(index) | MotionAction::PointerUp(index) = action {
        let index = index as usize;
        if index >= count {
            return Err(EventValidationError::InvalidPointerIndex { index, count });
        }
    }
    Ok(())
}

impl Display for KeyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyAction::Down => write!(f, "down"),
            KeyAction::Up => write!(f, "up"),
        }
    }
}

impl Display for MotionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionAction::Down => write!(f, "down"),
            MotionAction::Up => write!(f, "up"),
            MotionAction::Move => write!(f, "move"),
            MotionAction::Cancel => write!(f, "cancel"),
            MotionAction::Outside => write!(f, "outside"),
            MotionAction::HoverEnter => write!(f, "hover-enter"),
            MotionAction::HoverMove => write!(f, "hover-move"),
            MotionAction::HoverExit => write!(f, "hover-exit"),
            MotionAction::Scroll => write!(f, "scroll"),
            MotionAction::PointerDown(i) => write!(f, "pointer-down({i})"),
            MotionAction::PointerUp(i) => write!(f, "pointer-up({i})"),
        }
    }
}

impl Display for KeyEventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key({}, code={}, device={}, source={:?})",
            self.action, self.key_code, self.device_id, self.source
        )
    }
}

impl Display for MotionEventArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "motion({}, device={}, display={}, pointers={})",
            self.action,
            self.device_id,
            self.display_id,
            self.pointer_properties.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pointers(ids: &[u8]) -> (Vec<PointerProperties>, Vec<PointerCoords>) {
        let properties = ids
            .iter()
            .map(|&id| PointerProperties {
                id,
                tool_type: ToolType::Finger,
            })
            .collect();
        let coords = ids.iter().map(|_| PointerCoords::default()).collect();
        (properties, coords)
    }

    #[test]
    fn accepts_well_formed_motion() {
        let (props, coords) = pointers(&[7, 3]);
        assert!(validate_motion_event(MotionAction::PointerDown(1), &props, &coords).is_ok());
    }

    #[test]
    fn rejects_duplicate_pointer_ids() {
        let (props, coords) = pointers(&[4, 4]);
        assert_eq!(
            validate_motion_event(MotionAction::Move, &props, &coords),
            Err(EventValidationError::DuplicatePointerId(4))
        );
    }

    #[test]
    fn rejects_out_of_range_pointer_id() {
        let (props, coords) = pointers(&[32]);
        assert_eq!(
            validate_motion_event(MotionAction::Down, &props, &coords),
            Err(EventValidationError::InvalidPointerId(32))
        );
    }

    #[test]
    fn rejects_pointer_index_outside_array() {
        let (props, coords) = pointers(&[0]);
        assert_eq!(
            validate_motion_event(MotionAction::PointerUp(1), &props, &coords),
            Err(EventValidationError::InvalidPointerIndex { index: 1, count: 1 })
        );
    }

    #[test]
    fn rejects_empty_pointer_array() {
        assert_eq!(
            validate_motion_event(MotionAction::Down, &[], &[]),
            Err(EventValidationError::InvalidPointerCount(0))
        );
    }

    #[test]
    fn pointer_id_set_tracks_membership() {
        let mut set = PointerIdSet::empty();
        set.insert(0);
        set.insert(31);
        assert!(set.contains(0));
        assert!(set.contains(31));
        assert_eq!(set.count(), 2);
        set.remove(0);
        assert!(!set.contains(0));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![31]);
    }

    #[test]
    fn source_classes() {
        assert!(Source::TOUCHSCREEN.is_pointer());
        assert!(!Source::KEYBOARD.is_pointer());
        assert!(Source::JOYSTICK.is_streaming());
        assert!(Source::TRACKBALL.is_streaming());
        assert!(!Source::TOUCHSCREEN.is_streaming());
    }

    #[test]
    fn pointer_index_defaults_to_first() {
        assert_eq!(MotionAction::Move.pointer_index(), 0);
        assert_eq!(MotionAction::PointerUp(2).pointer_index(), 2);
    }
}
