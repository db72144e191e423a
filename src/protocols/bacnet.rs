//! BACnet/IP `readProperty` client
//!
//! Only the confirmed `readProperty` service for `present-value` (85) is
//! spoken. A request is one unicast BVLC frame. One background task owns the
//! receiving side of the socket and hands each reply to the request waiting
//! on its invoke id and source IP, so requests to different devices run
//! side by side and each is bounded by its own timeout. Everything else
//! arriving on the socket is skipped.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use super::error::{ReadError, ReadResult};
use super::{PointReader, RawValue};
use crate::points::MonitoredPoint;

const BVLC_TYPE: u8 = 0x81;
const BVLC_FORWARDED_NPDU: u8 = 0x04;
const BVLC_UNICAST_NPDU: u8 = 0x0A;
const BVLC_BROADCAST_NPDU: u8 = 0x0B;

const NPDU_VERSION: u8 = 0x01;
const NPDU_EXPECTING_REPLY: u8 = 0x04;

const PDU_CONFIRMED_REQUEST: u8 = 0;
const PDU_COMPLEX_ACK: u8 = 3;
const PDU_ERROR: u8 = 5;
const PDU_REJECT: u8 = 6;
const PDU_ABORT: u8 = 7;

const SERVICE_READ_PROPERTY: u8 = 0x0C;
const PROPERTY_PRESENT_VALUE: u8 = 85;

/// Max APDU accepted: 1476 octets, no segmentation
const MAX_APDU_1476: u8 = 0x05;

const MAX_OBJECT_TYPE: u32 = 0x3FF;
const MAX_INSTANCE: u32 = 0x3F_FFFF;

/// Decoded reply to a confirmed request
#[derive(Debug, Clone, PartialEq)]
pub enum Apdu {
    Ack { invoke_id: u8, value: RawValue },
    Empty { invoke_id: u8 },
    Error { invoke_id: u8, class: u32, code: u32 },
    Reject { invoke_id: u8, reason: u8 },
    Abort { invoke_id: u8, reason: u8 },
    /// Anything that is not a reply to us (I-Am, network messages, ...)
    Unrelated,
}

impl Apdu {
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::Ack { invoke_id, .. }
            | Apdu::Empty { invoke_id }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::Unrelated => None,
        }
    }

    fn into_value(self) -> ReadResult<RawValue> {
        match self {
            Apdu::Ack { value, .. } => Ok(value),
            Apdu::Empty { .. } => Err(ReadError::MissingValue),
            Apdu::Error { class, code, .. } => {
                Err(ReadError::Bacnet(format!("error class {class} code {code}")))
            }
            Apdu::Reject { reason, .. } => {
                Err(ReadError::Bacnet(format!("rejected, reason {reason}")))
            }
            Apdu::Abort { reason, .. } => {
                Err(ReadError::Bacnet(format!("aborted, reason {reason}")))
            }
            Apdu::Unrelated => Err(ReadError::Malformed("reply without invoke id".to_string())),
        }
    }
}

struct PendingRequest {
    peer: IpAddr,
    /// Tells this request apart from a later one reusing the invoke id
    token: u64,
    reply: oneshot::Sender<Apdu>,
}

type PendingRequests = Arc<Mutex<HashMap<u8, PendingRequest>>>;

fn lock(pending: &PendingRequests) -> MutexGuard<'_, HashMap<u8, PendingRequest>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the pending entry when a request finishes or is cancelled
struct PendingSlot<'a> {
    pending: &'a PendingRequests,
    invoke_id: u8,
    token: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        let mut pending = lock(self.pending);
        if pending
            .get(&self.invoke_id)
            .is_some_and(|request| request.token == self.token)
        {
            pending.remove(&self.invoke_id);
        }
    }
}

/// Shared BACnet/IP client
///
/// Owns one UDP socket for the process. Up to 256 requests can be in flight,
/// one per invoke id.
pub struct BacnetClient {
    socket: Arc<UdpSocket>,
    pending: PendingRequests,
    receiver: JoinHandle<()>,
    port: u16,
    timeout: Duration,
    invoke_id: AtomicU8,
    next_token: AtomicU64,
}

impl BacnetClient {
    /// Bind an ephemeral local port; `port` is the remote BACnet/IP port
    pub async fn bind(port: u16, timeout: Duration) -> ReadResult<Self> {
        let socket = Arc::new(UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?);
        debug!(local = ?socket.local_addr().ok(), "bound bacnet client socket");

        let pending = PendingRequests::default();
        let receiver = tokio::spawn(dispatch_replies(socket.clone(), pending.clone()));

        Ok(Self {
            socket,
            pending,
            receiver,
            port,
            timeout,
            invoke_id: AtomicU8::new(0),
            next_token: AtomicU64::new(0),
        })
    }

    async fn resolve(&self, host: &str) -> ReadResult<SocketAddr> {
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr);
        }

        tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|e| ReadError::Connection(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| ReadError::Connection(format!("no address for {host}")))
    }

    #[instrument(skip(self))]
    pub async fn read_present_value(
        &self,
        host: &str,
        object_type: u32,
        instance: u32,
    ) -> ReadResult<RawValue> {
        tokio::time::timeout(self.timeout, self.exchange(host, object_type, instance))
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))?
    }

    async fn exchange(&self, host: &str, object_type: u32, instance: u32) -> ReadResult<RawValue> {
        let target = self.resolve(host).await?;
        let (slot, reply) = self.register(target.ip())?;
        let request = encode_read_property(slot.invoke_id, object_type, instance)?;

        self.socket.send_to(&request, target).await?;

        let apdu = reply
            .await
            .map_err(|_| ReadError::Connection("bacnet receiver stopped".to_string()))?;
        apdu.into_value()
    }

    /// Reserve a free invoke id for a request to `peer`
    fn register(&self, peer: IpAddr) -> ReadResult<(PendingSlot<'_>, oneshot::Receiver<Apdu>)> {
        let mut pending = lock(&self.pending);
        for _ in 0..=u8::MAX {
            let invoke_id = self.invoke_id.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(entry) = pending.entry(invoke_id) {
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                entry.insert(PendingRequest {
                    peer,
                    token,
                    reply: tx,
                });

                let slot = PendingSlot {
                    pending: &self.pending,
                    invoke_id,
                    token,
                };
                return Ok((slot, rx));
            }
        }

        Err(ReadError::Bacnet("all invoke ids are in use".to_string()))
    }
}

impl Drop for BacnetClient {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

/// Route every reply on `socket` to the request waiting for it
async fn dispatch_replies(socket: Arc<UdpSocket>, pending: PendingRequests) {
    let mut buf = [0u8; 1500];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("bacnet receive failed: {e}");
                continue;
            }
        };

        let apdu = match decode_frame(&buf[..len]) {
            Ok(apdu) => apdu,
            Err(e) => {
                debug!(%from, "skipping malformed datagram: {e}");
                continue;
            }
        };
        let Some(invoke_id) = apdu.invoke_id() else {
            trace!(%from, "skipping unrelated apdu");
            continue;
        };

        let waiting = {
            let mut pending = lock(&pending);
            match pending.get(&invoke_id) {
                Some(request) if request.peer == from.ip() => pending.remove(&invoke_id),
                _ => None,
            }
        };
        match waiting {
            Some(request) => {
                // the requester may have timed out meanwhile
                let _ = request.reply.send(apdu);
            }
            None => trace!(%from, invoke_id, "no request waiting for this reply"),
        }
    }
}

/// Present-value reader over a shared [`BacnetClient`]
///
/// The object type comes from the protocol type catalogue (analog-input when
/// unset); the instance is the point address.
pub struct BacnetReader {
    client: Arc<BacnetClient>,
}

impl BacnetReader {
    pub fn new(client: Arc<BacnetClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PointReader for BacnetReader {
    async fn read(&self, point: &MonitoredPoint) -> ReadResult<RawValue> {
        let object_type = point.bacnet_object_type.unwrap_or(0);
        self.client
            .read_present_value(&point.host, object_type, point.address)
            .await
    }
}

pub fn encode_read_property(invoke_id: u8, object_type: u32, instance: u32) -> ReadResult<Vec<u8>> {
    if object_type > MAX_OBJECT_TYPE {
        return Err(ReadError::Config(format!("object type {object_type} out of range")));
    }
    if instance > MAX_INSTANCE {
        return Err(ReadError::Config(format!("object instance {instance} out of range")));
    }

    let object_id = (object_type << 22) | instance;

    let mut apdu = vec![
        PDU_CONFIRMED_REQUEST << 4,
        MAX_APDU_1476,
        invoke_id,
        SERVICE_READ_PROPERTY,
        // context tag 0, length 4: object identifier
        0x0C,
    ];
    apdu.extend(object_id.to_be_bytes());
    // context tag 1, length 1: property identifier
    apdu.extend([0x19, PROPERTY_PRESENT_VALUE]);

    let length = (4 + 2 + apdu.len()) as u16;
    let mut frame = vec![BVLC_TYPE, BVLC_UNICAST_NPDU];
    frame.extend(length.to_be_bytes());
    frame.extend([NPDU_VERSION, NPDU_EXPECTING_REPLY]);
    frame.extend(apdu);
    Ok(frame)
}

pub fn decode_frame(frame: &[u8]) -> ReadResult<Apdu> {
    let mut cursor = Cursor::new(frame);

    if cursor.u8()? != BVLC_TYPE {
        return Ok(Apdu::Unrelated);
    }
    match cursor.u8()? {
        BVLC_UNICAST_NPDU | BVLC_BROADCAST_NPDU => {
            cursor.u16()?;
        }
        BVLC_FORWARDED_NPDU => {
            cursor.u16()?;
            // originating B/IP address
            cursor.take(6)?;
        }
        _ => return Ok(Apdu::Unrelated),
    }

    if cursor.u8()? != NPDU_VERSION {
        return Err(ReadError::Malformed("unsupported npdu version".to_string()));
    }
    let control = cursor.u8()?;
    if control & 0x80 != 0 {
        return Ok(Apdu::Unrelated);
    }
    if control & 0x20 != 0 {
        cursor.u16()?;
        let len = cursor.u8()? as usize;
        cursor.take(len)?;
    }
    if control & 0x08 != 0 {
        cursor.u16()?;
        let len = cursor.u8()? as usize;
        cursor.take(len)?;
    }
    if control & 0x20 != 0 {
        // hop count
        cursor.u8()?;
    }

    decode_apdu(&mut cursor)
}

fn decode_apdu(cursor: &mut Cursor<'_>) -> ReadResult<Apdu> {
    let header = cursor.u8()?;

    match header >> 4 {
        PDU_COMPLEX_ACK => {
            if header & 0x08 != 0 {
                return Err(ReadError::Malformed("segmented ack not supported".to_string()));
            }
            let invoke_id = cursor.u8()?;
            if cursor.u8()? != SERVICE_READ_PROPERTY {
                return Ok(Apdu::Unrelated);
            }

            // object identifier, property identifier, optional array index
            expect_context_data(cursor, 0)?;
            expect_context_data(cursor, 1)?;
            let mut tag = Tag::read(cursor)?;
            if tag.context && tag.number == 2 {
                if let TagKind::Data(len) = tag.kind {
                    cursor.take(len)?;
                }
                tag = Tag::read(cursor)?;
            }
            if !(tag.context && tag.number == 3 && tag.kind == TagKind::Opening) {
                return Err(ReadError::Malformed("missing property value".to_string()));
            }

            let tag = Tag::read(cursor)?;
            if tag.context && tag.number == 3 && tag.kind == TagKind::Closing {
                return Ok(Apdu::Empty { invoke_id });
            }
            match decode_application_value(cursor, &tag)? {
                Some(value) => Ok(Apdu::Ack { invoke_id, value }),
                None => Ok(Apdu::Empty { invoke_id }),
            }
        }
        PDU_ERROR => {
            let invoke_id = cursor.u8()?;
            cursor.u8()?;
            let class = read_enumerated(cursor).unwrap_or_default();
            let code = read_enumerated(cursor).unwrap_or_default();
            Ok(Apdu::Error {
                invoke_id,
                class,
                code,
            })
        }
        PDU_REJECT => Ok(Apdu::Reject {
            invoke_id: cursor.u8()?,
            reason: cursor.u8()?,
        }),
        PDU_ABORT => Ok(Apdu::Abort {
            invoke_id: cursor.u8()?,
            reason: cursor.u8()?,
        }),
        _ => Ok(Apdu::Unrelated),
    }
}

fn expect_context_data(cursor: &mut Cursor<'_>, number: u8) -> ReadResult<()> {
    let tag = Tag::read(cursor)?;
    match tag.kind {
        TagKind::Data(len) if tag.context && tag.number == number => {
            cursor.take(len)?;
            Ok(())
        }
        _ => Err(ReadError::Malformed(format!("expected context tag {number}"))),
    }
}

fn read_enumerated(cursor: &mut Cursor<'_>) -> ReadResult<u32> {
    let tag = Tag::read(cursor)?;
    match (tag.context, tag.number, tag.kind) {
        (false, 9, TagKind::Data(len)) => Ok(unsigned(cursor.take(len)?) as u32),
        _ => Err(ReadError::Malformed("expected enumerated".to_string())),
    }
}

/// Decode one application-tagged primitive; `None` for NULL
fn decode_application_value(cursor: &mut Cursor<'_>, tag: &Tag) -> ReadResult<Option<RawValue>> {
    if tag.context {
        return Err(ReadError::Malformed("context tagged present value".to_string()));
    }
    let TagKind::Data(len) = tag.kind else {
        return Err(ReadError::Malformed("constructed present value".to_string()));
    };

    let value = match tag.number {
        0 => return Ok(None),
        // boolean carries its value in the length field
        1 => RawValue::Bool(len != 0),
        2 | 9 => RawValue::Integer(unsigned(cursor.take(len)?) as i64),
        3 => RawValue::Integer(signed(cursor.take(len)?)),
        4 => {
            let bytes: [u8; 4] = cursor
                .take(4)?
                .try_into()
                .map_err(|_| ReadError::Malformed("bad real".to_string()))?;
            let value = f32::from_be_bytes(bytes);
            if !value.is_finite() {
                return Err(ReadError::Malformed(format!("non-finite real {value}")));
            }
            // shortest decimal form of the f32, so 23.4 stays 23.4
            RawValue::Float(value.to_string().parse::<f64>().unwrap_or(value as f64))
        }
        5 => {
            let bytes: [u8; 8] = cursor
                .take(8)?
                .try_into()
                .map_err(|_| ReadError::Malformed("bad double".to_string()))?;
            let value = f64::from_be_bytes(bytes);
            if !value.is_finite() {
                return Err(ReadError::Malformed(format!("non-finite double {value}")));
            }
            RawValue::Float(value)
        }
        7 => {
            let bytes = cursor.take(len)?;
            let Some((_charset, text)) = bytes.split_first() else {
                return Err(ReadError::Malformed("empty character string".to_string()));
            };
            RawValue::Text(String::from_utf8_lossy(text).into_owned())
        }
        other => {
            return Err(ReadError::Malformed(format!(
                "unsupported application tag {other}"
            )));
        }
    };

    Ok(Some(value))
}

fn unsigned(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
}

fn signed(bytes: &[u8]) -> i64 {
    let seed = match bytes.first() {
        Some(first) if first & 0x80 != 0 => -1i64,
        _ => 0,
    };
    bytes.iter().fold(seed, |acc, byte| (acc << 8) | *byte as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Data(usize),
    Opening,
    Closing,
}

#[derive(Debug, Clone, Copy)]
struct Tag {
    number: u8,
    context: bool,
    kind: TagKind,
}

impl Tag {
    fn read(cursor: &mut Cursor<'_>) -> ReadResult<Self> {
        let first = cursor.u8()?;
        let context = first & 0x08 != 0;
        let mut number = first >> 4;
        if number == 0x0F {
            number = cursor.u8()?;
        }

        let kind = match first & 0x07 {
            6 if context => TagKind::Opening,
            7 if context => TagKind::Closing,
            5 => {
                let len = match cursor.u8()? {
                    254 => cursor.u16()? as usize,
                    255 => unsigned(cursor.take(4)?) as usize,
                    len => len as usize,
                };
                TagKind::Data(len)
            }
            len => TagKind::Data(len as usize),
        };

        Ok(Self {
            number,
            context,
            kind,
        })
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> ReadResult<&'a [u8]> {
        let end = self.pos.saturating_add(len);
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| ReadError::Malformed("truncated frame".to_string()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> ReadResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> ReadResult<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}
