//! Per-connection transport between the dispatcher and its consumers.
//!
//! An [`InputChannel`] pair is a bidirectional in-process pipe: the
//! dispatcher's [`InputPublisher`] pushes encoded event frames one way and
//! reads finished signals back; the consumer's [`InputConsumer`] does the
//! reverse. The event direction is bounded, so a consumer that stops reading
//! eventually surfaces [`TransportError::WouldBlock`] to the publisher, the
//! same way a full pipe would.

use dispatch_event::{
    ButtonState, DeviceId, DisplayId, EdgeFlags, KeyAction, KeyCode, KeyFlags, MetaState,
    MotionAction, MotionFlags, Nanos, PointerCoords, PointerProperties, ScanCode, Source, ToolType,
    MAX_POINTERS,
};
use num_enum::{IntoPrimitive, TryFromPrimitive, TryFromPrimitiveError};
use paste::paste;
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fmt::{self, Display, Formatter},
    mem::size_of,
    rc::Rc,
    sync::atomic::{AtomicU64, Ordering},
};
use thiserror::Error;

/// Maximum size of one encoded frame. Motion events with a full pointer
/// array are the largest frame on the wire.
pub const MAX_EVENT_SIZE: usize = size_of::<u8>()        // frame tag
    + size_of::<u32>()                                   // seq
    + 3 * size_of::<i32>()                               // device, display, key/scan
    + size_of::<u32>()                                   // source
    + 2 * size_of::<u8>()                                // action, pointer index
    + 4 * size_of::<u32>()                               // flags, meta, button, edge
    + 2 * size_of::<f32>()                               // precision
    + 2 * size_of::<u64>()                               // down time, event time
    + size_of::<u8>()                                    // pointer count
    + MAX_POINTERS * (2 * size_of::<u8>() + 4 * size_of::<f32>());

/// Default byte capacity of the event direction of a channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16 * 1024;

pub type ChannelId = u64;
pub type Seq = u32;

/// Error type for frame encode / decode violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// frame tag does not exist
    #[error("invalid frame tag: `{0}`")]
    InvalidFrameTag(#[from] TryFromPrimitiveError<FrameType>),
    /// key action byte does not exist
    #[error("invalid key action: `{0}`")]
    InvalidKeyAction(#[from] TryFromPrimitiveError<KeyAction>),
    /// motion action byte does not exist
    #[error("invalid motion action: `{0}`")]
    InvalidMotionAction(#[from] TryFromPrimitiveError<MotionActionCode>),
    /// tool type byte does not exist
    #[error("invalid tool type: `{0}`")]
    InvalidToolType(#[from] TryFromPrimitiveError<ToolType>),
    /// frame ended before its fields did
    #[error("frame truncated")]
    FrameTruncated,
    /// pointer count larger than MAX_POINTERS
    #[error("invalid pointer count: `{0}`")]
    InvalidPointerCount(u8),
}

/// Transport status surfaced by publish / receive operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// the bounded event direction is full
    #[error("channel buffer is full")]
    WouldBlock,
    /// the peer endpoint has been closed
    #[error("peer endpoint is closed")]
    Dead,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Key,
    Motion,
    Finished,
}

/// On-the-wire discriminant for [`MotionAction`]; the pointer index travels
/// in a separate byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MotionActionCode {
    Down,
    Up,
    Move,
    Cancel,
    Outside,
    HoverEnter,
    HoverMove,
    HoverExit,
    Scroll,
    PointerDown,
    PointerUp,
}

fn motion_action_parts(action: MotionAction) -> (MotionActionCode, u8) {
    match action {
        MotionAction::Down => (MotionActionCode::Down, 0),
        MotionAction::Up => (MotionActionCode::Up, 0),
        MotionAction::Move => (MotionActionCode::Move, 0),
        MotionAction::Cancel => (MotionActionCode::Cancel, 0),
        MotionAction::Outside => (MotionActionCode::Outside, 0),
        MotionAction::HoverEnter => (MotionActionCode::HoverEnter, 0),
        MotionAction::HoverMove => (MotionActionCode::HoverMove, 0),
        MotionAction::HoverExit => (MotionActionCode::HoverExit, 0),
        MotionAction::Scroll => (MotionActionCode::Scroll, 0),
        MotionAction::PointerDown(i) => (MotionActionCode::PointerDown, i),
        MotionAction::PointerUp(i) => (MotionActionCode::PointerUp, i),
    }
}

fn motion_action_from_parts(code: MotionActionCode, index: u8) -> MotionAction {
    match code {
        MotionActionCode::Down => MotionAction::Down,
        MotionActionCode::Up => MotionAction::Up,
        MotionActionCode::Move => MotionAction::Move,
        MotionActionCode::Cancel => MotionAction::Cancel,
        MotionActionCode::Outside => MotionAction::Outside,
        MotionActionCode::HoverEnter => MotionAction::HoverEnter,
        MotionActionCode::HoverMove => MotionAction::HoverMove,
        MotionActionCode::HoverExit => MotionAction::HoverExit,
        MotionActionCode::Scroll => MotionAction::Scroll,
        MotionActionCode::PointerDown => MotionAction::PointerDown(index),
        MotionActionCode::PointerUp => MotionAction::PointerUp(index),
    }
}

/// A key event as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireKeyEvent {
    pub seq: Seq,
    pub device_id: DeviceId,
    pub source: Source,
    pub action: KeyAction,
    pub flags: KeyFlags,
    pub key_code: KeyCode,
    pub scan_code: ScanCode,
    pub meta_state: MetaState,
    pub repeat_count: u32,
    pub down_time: Nanos,
    pub event_time: Nanos,
}

/// A motion event as delivered to a consumer. Coordinates have already been
/// transformed into the window's coordinate space.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMotionEvent {
    pub seq: Seq,
    pub device_id: DeviceId,
    pub source: Source,
    pub display_id: DisplayId,
    pub action: MotionAction,
    pub flags: MotionFlags,
    pub meta_state: MetaState,
    pub button_state: ButtonState,
    pub edge_flags: EdgeFlags,
    pub x_precision: f32,
    pub y_precision: f32,
    pub down_time: Nanos,
    pub event_time: Nanos,
    pub pointer_properties: Vec<PointerProperties>,
    pub pointer_coords: Vec<PointerCoords>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    Key(WireKeyEvent),
    Motion(WireMotionEvent),
}

impl WireEvent {
    pub fn seq(&self) -> Seq {
        match self {
            WireEvent::Key(key) => key.seq,
            WireEvent::Motion(motion) => motion.seq,
        }
    }
}

impl Display for WireEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WireEvent::Key(key) => write!(f, "key({}, code={})", key.action, key.key_code),
            WireEvent::Motion(motion) => write!(
                f,
                "motion({}, pointers={})",
                motion.action,
                motion.pointer_properties.len()
            ),
        }
    }
}

macro_rules! decode_impl {
    ($t:ty) => {
        paste! {
            fn [<decode_ $t>](data: &mut &[u8]) -> Result<$t, ProtocolError> {
                if data.len() < size_of::<$t>() {
                    return Err(ProtocolError::FrameTruncated);
                }
                let (bytes, rest) = data.split_at(size_of::<$t>());
                *data = rest;
                Ok($t::from_be_bytes(bytes.try_into().expect("sized split")))
            }
        }
    };
}

decode_impl!(u8);
decode_impl!(u32);
decode_impl!(i32);
decode_impl!(u64);
decode_impl!(f32);

macro_rules! encode_impl {
    ($t:ty) => {
        paste! {
            fn [<encode_ $t>](buf: &mut &mut [u8], amt: &mut usize, n: $t) {
                let src = n.to_be_bytes();
                let data = std::mem::take(buf);
                let (bytes, rest) = data.split_at_mut(size_of::<$t>());
                bytes.copy_from_slice(&src);
                *amt += size_of::<$t>();
                *buf = rest;
            }
        }
    };
}

encode_impl!(u8);
encode_impl!(u32);
encode_impl!(i32);
encode_impl!(u64);
encode_impl!(f32);

fn encode_key(event: &WireKeyEvent) -> ([u8; MAX_EVENT_SIZE], usize) {
    let mut frame = [0u8; MAX_EVENT_SIZE];
    let mut len = 0usize;
    {
        let mut buf = &mut frame[..];
        let buf = &mut buf;
        let len = &mut len;
        encode_u8(buf, len, FrameType::Key.into());
        encode_u32(buf, len, event.seq);
        encode_i32(buf, len, event.device_id);
        encode_u32(buf, len, event.source.bits());
        encode_u8(buf, len, event.action.into());
        encode_u32(buf, len, event.flags.bits());
        encode_i32(buf, len, event.key_code);
        encode_i32(buf, len, event.scan_code);
        encode_u32(buf, len, event.meta_state);
        encode_u32(buf, len, event.repeat_count);
        encode_u64(buf, len, event.down_time);
        encode_u64(buf, len, event.event_time);
    }
    (frame, len)
}

fn encode_motion(event: &WireMotionEvent) -> ([u8; MAX_EVENT_SIZE], usize) {
    let mut frame = [0u8; MAX_EVENT_SIZE];
    let mut len = 0usize;
    {
        let mut buf = &mut frame[..];
        let buf = &mut buf;
        let len = &mut len;
        let (code, pointer_index) = motion_action_parts(event.action);
        encode_u8(buf, len, FrameType::Motion.into());
        encode_u32(buf, len, event.seq);
        encode_i32(buf, len, event.device_id);
        encode_u32(buf, len, event.source.bits());
        encode_i32(buf, len, event.display_id);
        encode_u8(buf, len, code.into());
        encode_u8(buf, len, pointer_index);
        encode_u32(buf, len, event.flags.bits());
        encode_u32(buf, len, event.meta_state);
        encode_u32(buf, len, event.button_state);
        encode_u32(buf, len, event.edge_flags);
        encode_f32(buf, len, event.x_precision);
        encode_f32(buf, len, event.y_precision);
        encode_u64(buf, len, event.down_time);
        encode_u64(buf, len, event.event_time);
        encode_u8(buf, len, event.pointer_properties.len() as u8);
        for (properties, coords) in event
            .pointer_properties
            .iter()
            .zip(event.pointer_coords.iter())
        {
            encode_u8(buf, len, properties.id);
            encode_u8(buf, len, properties.tool_type.into());
            encode_f32(buf, len, coords.x);
            encode_f32(buf, len, coords.y);
            encode_f32(buf, len, coords.pressure);
            encode_f32(buf, len, coords.size);
        }
    }
    (frame, len)
}

fn encode_finished(seq: Seq, handled: bool) -> ([u8; MAX_EVENT_SIZE], usize) {
    let mut frame = [0u8; MAX_EVENT_SIZE];
    let mut len = 0usize;
    {
        let mut buf = &mut frame[..];
        let buf = &mut buf;
        let len = &mut len;
        encode_u8(buf, len, FrameType::Finished.into());
        encode_u32(buf, len, seq);
        encode_u8(buf, len, u8::from(handled));
    }
    (frame, len)
}

fn decode_event(mut data: &[u8]) -> Result<WireEvent, ProtocolError> {
    let data = &mut data;
    match FrameType::try_from(decode_u8(data)?)? {
        FrameType::Key => Ok(WireEvent::Key(WireKeyEvent {
            seq: decode_u32(data)?,
            device_id: decode_i32(data)?,
            source: Source::from_bits_retain(decode_u32(data)?),
            action: KeyAction::try_from(decode_u8(data)?)?,
            flags: KeyFlags::from_bits_retain(decode_u32(data)?),
            key_code: decode_i32(data)?,
            scan_code: decode_i32(data)?,
            meta_state: decode_u32(data)?,
            repeat_count: decode_u32(data)?,
            down_time: decode_u64(data)?,
            event_time: decode_u64(data)?,
        })),
        FrameType::Motion => {
            let seq = decode_u32(data)?;
            let device_id = decode_i32(data)?;
            let source = Source::from_bits_retain(decode_u32(data)?);
            let display_id = decode_i32(data)?;
            let code = MotionActionCode::try_from(decode_u8(data)?)?;
            let pointer_index = decode_u8(data)?;
            let flags = MotionFlags::from_bits_retain(decode_u32(data)?);
            let meta_state = decode_u32(data)?;
            let button_state = decode_u32(data)?;
            let edge_flags = decode_u32(data)?;
            let x_precision = decode_f32(data)?;
            let y_precision = decode_f32(data)?;
            let down_time = decode_u64(data)?;
            let event_time = decode_u64(data)?;
            let pointer_count = decode_u8(data)?;
            if pointer_count as usize > MAX_POINTERS {
                return Err(ProtocolError::InvalidPointerCount(pointer_count));
            }
            let mut pointer_properties = Vec::with_capacity(pointer_count as usize);
            let mut pointer_coords = Vec::with_capacity(pointer_count as usize);
            for _ in 0..pointer_count {
                pointer_properties.push(PointerProperties {
                    id: decode_u8(data)?,
                    tool_type: ToolType::try_from(decode_u8(data)?)?,
                });
                pointer_coords.push(PointerCoords {
                    x: decode_f32(data)?,
                    y: decode_f32(data)?,
                    pressure: decode_f32(data)?,
                    size: decode_f32(data)?,
                });
            }
            Ok(WireEvent::Motion(WireMotionEvent {
                seq,
                device_id,
                source,
                display_id,
                action: motion_action_from_parts(code, pointer_index),
                flags,
                meta_state,
                button_state,
                edge_flags,
                x_precision,
                y_precision,
                down_time,
                event_time,
                pointer_properties,
                pointer_coords,
            }))
        }
        FrameType::Finished => Err(ProtocolError::FrameTruncated),
    }
}

fn decode_finished(mut data: &[u8]) -> Result<(Seq, bool), ProtocolError> {
    let data = &mut data;
    match FrameType::try_from(decode_u8(data)?)? {
        FrameType::Finished => {
            let seq = decode_u32(data)?;
            let handled = decode_u8(data)? != 0;
            Ok((seq, handled))
        }
        _ => Err(ProtocolError::FrameTruncated),
    }
}

/// Length-prefixed frame buffer with an optional byte capacity.
struct FrameRing {
    bytes: VecDeque<u8>,
    capacity: Option<usize>,
}

impl FrameRing {
    fn new(capacity: Option<usize>) -> Self {
        FrameRing {
            bytes: VecDeque::new(),
            capacity,
        }
    }

    fn push(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let needed = frame.len() + size_of::<u16>();
        if let Some(capacity) = self.capacity {
            if self.bytes.len() + needed > capacity {
                return Err(TransportError::WouldBlock);
            }
        }
        self.bytes.extend((frame.len() as u16).to_be_bytes());
        self.bytes.extend(frame.iter().copied());
        Ok(())
    }

    fn pop(&mut self) -> Option<Vec<u8>> {
        if self.bytes.len() < size_of::<u16>() {
            return None;
        }
        let hi = self.bytes[0];
        let lo = self.bytes[1];
        let len = u16::from_be_bytes([hi, lo]) as usize;
        if self.bytes.len() < size_of::<u16>() + len {
            return None;
        }
        self.bytes.drain(..size_of::<u16>());
        Some(self.bytes.drain(..len).collect())
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Client,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::Server => Side::Client,
            Side::Client => Side::Server,
        }
    }
}

type ReadyListener = Box<dyn Fn()>;

struct ChannelCore {
    id: ChannelId,
    name: Rc<str>,
    /// server -> client (events)
    forward: RefCell<FrameRing>,
    /// client -> server (finished signals)
    backward: RefCell<FrameRing>,
    server_open: Cell<bool>,
    client_open: Cell<bool>,
    server_listener: RefCell<Option<ReadyListener>>,
    client_listener: RefCell<Option<ReadyListener>>,
}

impl ChannelCore {
    fn open(&self, side: Side) -> bool {
        match side {
            Side::Server => self.server_open.get(),
            Side::Client => self.client_open.get(),
        }
    }

    fn close(&self, side: Side) {
        match side {
            Side::Server => self.server_open.set(false),
            Side::Client => self.client_open.set(false),
        }
        self.notify(side.peer());
    }

    /// Wake whoever reads on `side`, outside of any ring borrow.
    fn notify(&self, side: Side) {
        let listener = match side {
            Side::Server => &self.server_listener,
            Side::Client => &self.client_listener,
        };
        if let Some(listener) = listener.borrow().as_ref() {
            listener();
        }
    }
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// One endpoint of a dispatcher/consumer pipe. Cheap to clone; equality is
/// by channel identity, so both endpoints of one pair compare equal.
#[derive(Clone)]
pub struct InputChannel {
    core: Rc<ChannelCore>,
    side: Side,
}

impl InputChannel {
    /// Creates a connected (server, client) endpoint pair with the default
    /// event capacity.
    pub fn pair(name: &str) -> (InputChannel, InputChannel) {
        Self::pair_with_capacity(name, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn pair_with_capacity(name: &str, capacity: usize) -> (InputChannel, InputChannel) {
        let core = Rc::new(ChannelCore {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            name: Rc::from(name),
            forward: RefCell::new(FrameRing::new(Some(capacity))),
            backward: RefCell::new(FrameRing::new(None)),
            server_open: Cell::new(true),
            client_open: Cell::new(true),
            server_listener: RefCell::new(None),
            client_listener: RefCell::new(None),
        });
        (
            InputChannel {
                core: core.clone(),
                side: Side::Server,
            },
            InputChannel {
                core,
                side: Side::Client,
            },
        )
    }

    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Installs the readiness callback for this endpoint. It fires after
    /// data arrives for this side and when the peer closes.
    pub fn set_ready_listener(&self, listener: Option<ReadyListener>) {
        let slot = match self.side {
            Side::Server => &self.core.server_listener,
            Side::Client => &self.core.client_listener,
        };
        *slot.borrow_mut() = listener;
    }

    fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.core.open(self.side.peer()) {
            return Err(TransportError::Dead);
        }
        {
            let ring = match self.side {
                Side::Server => &self.core.forward,
                Side::Client => &self.core.backward,
            };
            ring.borrow_mut().push(frame)?;
        }
        self.core.notify(self.side.peer());
        Ok(())
    }

    fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let ring = match self.side {
            Side::Server => &self.core.backward,
            Side::Client => &self.core.forward,
        };
        let frame = ring.borrow_mut().pop();
        match frame {
            Some(frame) => Ok(frame),
            None if !self.core.open(self.side.peer()) => Err(TransportError::Dead),
            None => Err(TransportError::WouldBlock),
        }
    }
}

impl PartialEq for InputChannel {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for InputChannel {}

impl fmt::Debug for InputChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "InputChannel('{}', id={})", self.name(), self.id())
    }
}

/// Dispatcher-side endpoint wrapper: publishes events, reads finished
/// signals. Closes the server endpoint when dropped.
pub struct InputPublisher {
    channel: InputChannel,
}

impl InputPublisher {
    pub fn new(channel: InputChannel) -> Self {
        InputPublisher { channel }
    }

    pub fn channel(&self) -> &InputChannel {
        &self.channel
    }

    pub fn publish_key_event(&self, event: &WireKeyEvent) -> Result<(), TransportError> {
        let (frame, len) = encode_key(event);
        self.channel.send(&frame[..len])
    }

    pub fn publish_motion_event(&self, event: &WireMotionEvent) -> Result<(), TransportError> {
        let (frame, len) = encode_motion(event);
        self.channel.send(&frame[..len])
    }

    /// Reads one `(seq, handled)` acknowledgement, or `WouldBlock` when the
    /// consumer has not finished anything new.
    pub fn receive_finished_signal(&self) -> Result<(Seq, bool), TransportError> {
        let frame = self.channel.recv()?;
        Ok(decode_finished(&frame)?)
    }
}

impl Drop for InputPublisher {
    fn drop(&mut self) {
        self.channel.core.close(Side::Server);
    }
}

/// Consumer-side endpoint wrapper: reads events, sends finished signals.
/// Closes the client endpoint when dropped, which the dispatcher observes as
/// a dead channel.
pub struct InputConsumer {
    channel: InputChannel,
}

impl InputConsumer {
    pub fn new(channel: InputChannel) -> Self {
        InputConsumer { channel }
    }

    pub fn channel(&self) -> &InputChannel {
        &self.channel
    }

    pub fn receive_event(&self) -> Result<WireEvent, TransportError> {
        let frame = self.channel.recv()?;
        Ok(decode_event(&frame)?)
    }

    pub fn send_finished_signal(&self, seq: Seq, handled: bool) -> Result<(), TransportError> {
        let (frame, len) = encode_finished(seq, handled);
        self.channel.send(&frame[..len])
    }
}

impl Drop for InputConsumer {
    fn drop(&mut self) {
        self.channel.core.close(Side::Client);
    }
}
