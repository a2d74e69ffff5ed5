//! The seam between the jam core and whatever actually moves bytes between browsers,
//! apps or processes.
//!
//! A transport hands out a [`PeerHandle`] per broker identity.  The identity opens
//! [`DataLink`]s (reliable json channels) and [`MediaLink`]s (audio/video calls) to
//! other identities.  All three publish their lifecycle through an [`Emitter`].
//!
//! Transports must deliver events asynchronously: never from inside the call that
//! caused them.  Components subscribe right after `create`/`connect`/`call` return and
//! rely on not having missed anything.
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::rc::Rc;

use super::peer_error::PeerError;
use crate::common::{
    box_error::BoxError,
    emitter::{Emitter, EventKind},
};

/// free-form json attached to a connection when it is opened
pub type Metadata = Value;

/// Handle to a captured or received audio/video stream.  Cloning shares the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaStream {
    pub id: String,
    pub audio: bool,
    pub video: bool,
}

impl MediaStream {
    pub fn new(id: &str, audio: bool, video: bool) -> MediaStream {
        MediaStream {
            id: id.to_string(),
            audio,
            video,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub metadata: Metadata,
    pub label: Option<String>,
}

#[derive(Debug)]
pub enum PeerEvent {
    /// registered with the broker under this id
    Open(String),
    Error(PeerError),
    /// another identity opened a data link to us
    Connection(Rc<dyn DataLink>),
    /// another identity is calling us
    Call(Rc<dyn MediaLink>),
    /// lost the broker but the identity is still alive
    Disconnected,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PeerEventKind {
    Open,
    Error,
    Connection,
    Call,
    Disconnected,
    Close,
}

impl EventKind for PeerEvent {
    type Kind = PeerEventKind;
    fn kind(&self) -> PeerEventKind {
        match self {
            PeerEvent::Open(_) => PeerEventKind::Open,
            PeerEvent::Error(_) => PeerEventKind::Error,
            PeerEvent::Connection(_) => PeerEventKind::Connection,
            PeerEvent::Call(_) => PeerEventKind::Call,
            PeerEvent::Disconnected => PeerEventKind::Disconnected,
            PeerEvent::Close => PeerEventKind::Close,
        }
    }
}

#[derive(Debug, Clone)]
pub enum DataEvent {
    Open,
    Data(Value),
    Error(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataEventKind {
    Open,
    Data,
    Error,
    Close,
}

impl EventKind for DataEvent {
    type Kind = DataEventKind;
    fn kind(&self) -> DataEventKind {
        match self {
            DataEvent::Open => DataEventKind::Open,
            DataEvent::Data(_) => DataEventKind::Data,
            DataEvent::Error(_) => DataEventKind::Error,
            DataEvent::Close => DataEventKind::Close,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// the remote side's stream is available
    Stream(MediaStream),
    Error(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MediaEventKind {
    Stream,
    Error,
    Close,
}

impl EventKind for MediaEvent {
    type Kind = MediaEventKind;
    fn kind(&self) -> MediaEventKind {
        match self {
            MediaEvent::Stream(_) => MediaEventKind::Stream,
            MediaEvent::Error(_) => MediaEventKind::Error,
            MediaEvent::Close => MediaEventKind::Close,
        }
    }
}

/// One registration with the broker.
pub trait PeerHandle {
    /// the id the broker confirmed, empty until then
    fn id(&self) -> String;
    fn is_disconnected(&self) -> bool;
    fn is_destroyed(&self) -> bool;
    fn connect(&self, target: &str, options: ConnectOptions) -> Rc<dyn DataLink>;
    fn call(&self, target: &str, stream: &MediaStream, metadata: Metadata) -> Rc<dyn MediaLink>;
    /// reattach to the broker keeping the same id and connections
    fn reconnect(&self);
    /// close every link and give up the id for good
    fn destroy(&self);
    fn events(&self) -> &Emitter<PeerEvent>;
}

/// Creates identities.  An empty `requested_id` lets the broker pick one.
pub trait PeerFactory {
    fn create(&self, requested_id: &str) -> Rc<dyn PeerHandle>;
}

pub trait DataLink {
    /// id of the identity on the other end
    fn peer(&self) -> String;
    fn is_open(&self) -> bool;
    fn metadata(&self) -> Metadata;
    fn label(&self) -> Option<String>;
    fn send(&self, data: &Value) -> Result<(), BoxError>;
    fn close(&self);
    fn events(&self) -> &Emitter<DataEvent>;
}

pub trait MediaLink {
    fn peer(&self) -> String;
    fn metadata(&self) -> Metadata;
    fn is_open(&self) -> bool;
    /// accept an incoming call, sending `stream` back
    fn answer(&self, stream: &MediaStream);
    fn close(&self);
    fn events(&self) -> &Emitter<MediaEvent>;
}

impl fmt::Debug for dyn DataLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DataLink {{ peer: {}, open: {} }}", self.peer(), self.is_open())
    }
}

impl fmt::Debug for dyn MediaLink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MediaLink {{ peer: {}, open: {} }}", self.peer(), self.is_open())
    }
}

/// identity of two handles to the same link
pub fn same_link<T: ?Sized>(a: &Rc<T>, b: &Rc<T>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}
