//! Wire messages and their codec.
//!
//! Every message starts with a 1-byte type tag. All but the legacy data
//! message follow it with a little-endian u16 tenant ID; the data message
//! keeps the tenant inside its storage section so the same bytes can be
//! appended to the log verbatim.
//!
//! Forward compatibility: unknown trailing bytes are ignored. Backward
//! compatibility: a handful of newer suffix fields (subscribe cursors,
//! unsubscribe topic, deliver topic/source) may be absent in old messages,
//! in which case the fields decode as empty.

use bytes::Bytes;

use crate::coding::{
    put_fixed16, put_fixed64, put_length_prefixed, put_subscription_id, put_topic_id,
    put_varint32, put_varint64, Decoder,
};
use crate::error::ProtocolError;
use crate::types::{
    Cursor, GapType, MsgId, NamespaceID, SequenceNumber, ShardID, SubscriptionID, TenantID, Topic,
};

/// Wire message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    Publish = 2,
    // 3 was a metadata message, long since retired.
    DataAck = 4,
    Gap = 5,
    Deliver = 6,
    Goodbye = 7,
    Subscribe = 8,
    Unsubscribe = 9,
    DeliverGap = 10,
    DeliverData = 11,
    FindTailSeqno = 12,
    TailSeqno = 13,
    DeliverBatch = 14,
    Heartbeat = 15,
    HeartbeatDelta = 16,
    BacklogQuery = 17,
    BacklogFill = 18,
    Introduction = 19,
    SubAck = 20,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Ping),
            2 => Ok(MessageType::Publish),
            4 => Ok(MessageType::DataAck),
            5 => Ok(MessageType::Gap),
            6 => Ok(MessageType::Deliver),
            7 => Ok(MessageType::Goodbye),
            8 => Ok(MessageType::Subscribe),
            9 => Ok(MessageType::Unsubscribe),
            10 => Ok(MessageType::DeliverGap),
            11 => Ok(MessageType::DeliverData),
            12 => Ok(MessageType::FindTailSeqno),
            13 => Ok(MessageType::TailSeqno),
            14 => Ok(MessageType::DeliverBatch),
            15 => Ok(MessageType::Heartbeat),
            16 => Ok(MessageType::HeartbeatDelta),
            17 => Ok(MessageType::BacklogQuery),
            18 => Ok(MessageType::BacklogFill),
            19 => Ok(MessageType::Introduction),
            20 => Ok(MessageType::SubAck),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

/// Whether a legacy data message travels on the publish or deliver path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMessageType {
    Publish,
    Deliver,
}

/// Ping direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PingType {
    Request = 0,
    Response = 1,
}

impl TryFrom<u8> for PingType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PingType::Request),
            1 => Ok(PingType::Response),
            _ => Err(ProtocolError::InvalidEnum {
                what: "PingType",
                value,
            }),
        }
    }
}

/// Outcome of a publish, carried per-message in a data ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    Success = 0,
    Failure = 1,
}

impl TryFrom<u8> for AckStatus {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AckStatus::Success),
            1 => Ok(AckStatus::Failure),
            _ => Err(ProtocolError::InvalidEnum {
                what: "AckStatus",
                value,
            }),
        }
    }
}

/// Why a goodbye was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GoodbyeCode {
    SocketError = 0,
    Graceful = 1,
}

impl TryFrom<u8> for GoodbyeCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(GoodbyeCode::SocketError),
            1 => Ok(GoodbyeCode::Graceful),
            _ => Err(ProtocolError::InvalidEnum {
                what: "GoodbyeCode",
                value,
            }),
        }
    }
}

/// Which side of the connection a goodbye originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OriginType {
    Server = 0,
    Client = 1,
}

impl TryFrom<u8> for OriginType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OriginType::Server),
            1 => Ok(OriginType::Client),
            _ => Err(ProtocolError::InvalidEnum {
                what: "OriginType",
                value,
            }),
        }
    }
}

/// Why a subscription was terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnsubscribeReason {
    /// The subscriber asked for it.
    Requested = 0,
    /// The subscription is not known to the peer.
    Invalid = 1,
    /// The peer is overloaded and sheds the subscription.
    BackOff = 2,
}

impl TryFrom<u8> for UnsubscribeReason {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UnsubscribeReason::Requested),
            1 => Ok(UnsubscribeReason::Invalid),
            2 => Ok(UnsubscribeReason::BackOff),
            _ => Err(ProtocolError::InvalidEnum {
                what: "UnsubscribeReason",
                value,
            }),
        }
    }
}

/// How much of a backlog query a fill answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FillResult {
    Complete = 0,
    Partial = 1,
    NoData = 2,
}

impl TryFrom<u8> for FillResult {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FillResult::Complete),
            1 => Ok(FillResult::Partial),
            2 => Ok(FillResult::NoData),
            _ => Err(ProtocolError::InvalidEnum {
                what: "FillResult",
                value,
            }),
        }
    }
}

/// Keep-alive probe carrying an opaque cookie the peer echoes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePing {
    pub tenant_id: TenantID,
    pub ping_type: PingType,
    pub cookie: Bytes,
}

/// Legacy data message used on the publish path and for tower fan-out.
///
/// The serialised form splits into a sequencing prefix and a storage
/// section; the storage section alone is what lands in the log, so
/// `encode_storage`/`decode_storage` are exposed for the tailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageData {
    pub data_type: DataMessageType,
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub msg_id: MsgId,
    pub payload: Bytes,
    pub prev_seqno: SequenceNumber,
    pub seqno: SequenceNumber,
}

impl MessageData {
    pub fn new(
        data_type: DataMessageType,
        tenant_id: TenantID,
        namespace_id: impl Into<NamespaceID>,
        topic: impl Into<Topic>,
        msg_id: MsgId,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            data_type,
            tenant_id,
            namespace_id: namespace_id.into(),
            topic: topic.into(),
            msg_id,
            payload: payload.into(),
            prev_seqno: 0,
            seqno: 0,
        }
    }

    /// Set the sequencing prefix once storage has assigned a position.
    pub fn set_sequence_numbers(&mut self, prev_seqno: SequenceNumber, seqno: SequenceNumber) {
        debug_assert!(seqno >= prev_seqno);
        self.prev_seqno = prev_seqno;
        self.seqno = seqno;
    }

    /// Serialise the storage section: what goes into the log.
    pub fn encode_storage(&self, out: &mut Vec<u8>) {
        put_fixed16(out, self.tenant_id);
        put_topic_id(out, &self.namespace_id, &self.topic);
        put_length_prefixed(out, &self.msg_id.0);
        put_length_prefixed(out, &self.payload);
    }

    /// Parse a storage section previously written by `encode_storage`.
    /// The result carries zero sequence numbers; the caller fills them from
    /// the log position.
    pub fn decode_storage(buf: &[u8], data_type: DataMessageType) -> Result<Self, ProtocolError> {
        let mut dec = Decoder::new(buf);
        let mut msg = Self::decode_storage_fields(&mut dec, data_type)?;
        msg.prev_seqno = 0;
        msg.seqno = 0;
        Ok(msg)
    }

    fn decode_storage_fields(
        dec: &mut Decoder<'_>,
        data_type: DataMessageType,
    ) -> Result<Self, ProtocolError> {
        let tenant_id = dec.get_fixed16("tenant")?;
        let (namespace_id, topic) = dec.get_topic_id("topic id")?;
        let id_bytes = dec.get_length_prefixed("msg id")?;
        if id_bytes.len() < 16 {
            return Err(ProtocolError::Truncated("msg id"));
        }
        let mut msg_id = MsgId::default();
        msg_id.0.copy_from_slice(&id_bytes[..16]);
        let payload = dec.get_length_prefixed_bytes("payload")?;
        Ok(Self {
            data_type,
            tenant_id,
            namespace_id,
            topic,
            msg_id,
            payload,
            prev_seqno: 0,
            seqno: 0,
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_varint64(out, self.prev_seqno);
        put_varint64(out, self.seqno);
        self.encode_storage(out);
    }

    fn decode(
        dec: &mut Decoder<'_>,
        data_type: DataMessageType,
    ) -> Result<Self, ProtocolError> {
        let prev_seqno = dec.get_seqno("prev seqno")?;
        let seqno = dec.get_seqno("seqno")?;
        let mut msg = Self::decode_storage_fields(dec, data_type)?;
        msg.prev_seqno = prev_seqno;
        msg.seqno = seqno;
        Ok(msg)
    }
}

/// One acknowledgement within a data ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub status: AckStatus,
    pub msg_id: MsgId,
    pub seqno: SequenceNumber,
}

/// Batch of publish acknowledgements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDataAck {
    pub tenant_id: TenantID,
    pub acks: Vec<Ack>,
}

/// Legacy gap message used on the tower fan-out path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGap {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub gap_type: GapType,
    pub from: SequenceNumber,
    pub to: SequenceNumber,
}

/// Stream teardown notice. Also synthesised locally when a socket dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageGoodbye {
    pub tenant_id: TenantID,
    pub code: GoodbyeCode,
    pub origin_type: OriginType,
}

/// Subscription request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSubscribe {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub sub_id: SubscriptionID,
    /// Start cursors; old peers send a single seqno which decodes as one
    /// cursor with an empty source.
    pub start: Vec<Cursor>,
}

/// Subscription teardown request or notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUnsubscribe {
    pub tenant_id: TenantID,
    pub sub_id: SubscriptionID,
    pub reason: UnsubscribeReason,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
}

/// Gap delivery on a subscription (modern header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeliverGap {
    pub tenant_id: TenantID,
    pub sub_id: SubscriptionID,
    pub prev_seqno: SequenceNumber,
    pub seqno: SequenceNumber,
    pub gap_type: GapType,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub source: Bytes,
}

/// Data delivery on a subscription (modern header).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeliverData {
    pub tenant_id: TenantID,
    pub sub_id: SubscriptionID,
    pub prev_seqno: SequenceNumber,
    pub seqno: SequenceNumber,
    pub msg_id: MsgId,
    pub payload: Bytes,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub source: Bytes,
}

/// Batch of data deliveries, each body length-prefixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDeliverBatch {
    pub tenant_id: TenantID,
    pub messages: Vec<MessageDeliverData>,
}

/// Aggregated liveness report for a set of shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeartbeat {
    pub tenant_id: TenantID,
    pub timestamp_ms: u64,
    /// Strictly ascending shard IDs.
    pub healthy_shards: Vec<ShardID>,
}

/// Heartbeat encoded as a delta against the previously sent set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeartbeatDelta {
    pub tenant_id: TenantID,
    pub timestamp_ms: u64,
    pub added_healthy: Vec<ShardID>,
    pub removed_healthy: Vec<ShardID>,
}

/// Ask the server for the tail sequence number of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFindTailSeqno {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
}

/// Answer to `FindTailSeqno`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTailSeqno {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub seqno: SequenceNumber,
}

/// Ask for a backlog range on a subscription source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBacklogQuery {
    pub tenant_id: TenantID,
    pub sub_id: SubscriptionID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub source: Bytes,
    pub seqno: SequenceNumber,
}

/// Answer to a backlog query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBacklogFill {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub source: Bytes,
    pub prev_seqno: SequenceNumber,
    pub next_seqno: SequenceNumber,
    pub result: FillResult,
    pub info: Bytes,
}

/// First message on a fresh stream, carrying stream and client properties.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageIntroduction {
    pub tenant_id: TenantID,
    pub stream_properties: Vec<(Bytes, Bytes)>,
    pub client_properties: Vec<(Bytes, Bytes)>,
}

/// Server acknowledgement of a subscription, echoing effective cursors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSubAck {
    pub tenant_id: TenantID,
    pub namespace_id: NamespaceID,
    pub topic: Topic,
    pub sub_id: SubscriptionID,
    pub cursors: Vec<Cursor>,
}

/// Any wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(MessagePing),
    Data(MessageData),
    DataAck(MessageDataAck),
    Gap(MessageGap),
    Goodbye(MessageGoodbye),
    Subscribe(MessageSubscribe),
    Unsubscribe(MessageUnsubscribe),
    DeliverGap(MessageDeliverGap),
    DeliverData(MessageDeliverData),
    DeliverBatch(MessageDeliverBatch),
    Heartbeat(MessageHeartbeat),
    HeartbeatDelta(MessageHeartbeatDelta),
    FindTailSeqno(MessageFindTailSeqno),
    TailSeqno(MessageTailSeqno),
    BacklogQuery(MessageBacklogQuery),
    BacklogFill(MessageBacklogFill),
    Introduction(MessageIntroduction),
    SubAck(MessageSubAck),
}

/// Encode the modern deliver header: sub id, prev seqno, seqno difference.
fn put_deliver_header(
    out: &mut Vec<u8>,
    tenant_id: TenantID,
    sub_id: SubscriptionID,
    prev_seqno: SequenceNumber,
    seqno: SequenceNumber,
) {
    debug_assert!(seqno >= prev_seqno);
    put_fixed16(out, tenant_id);
    put_subscription_id(out, sub_id);
    put_varint64(out, prev_seqno);
    put_varint64(out, seqno.saturating_sub(prev_seqno));
}

fn get_deliver_header(
    dec: &mut Decoder<'_>,
) -> Result<(TenantID, SubscriptionID, SequenceNumber, SequenceNumber), ProtocolError> {
    let tenant_id = dec.get_fixed16("tenant")?;
    let sub_id = dec.get_subscription_id("sub id")?;
    let prev_seqno = dec.get_seqno("prev seqno")?;
    let diff = dec.get_varint64("seqno diff")?;
    let seqno = prev_seqno
        .checked_add(diff)
        .ok_or(ProtocolError::InvalidVarint)?;
    Ok((tenant_id, sub_id, prev_seqno, seqno))
}

fn put_cursors(out: &mut Vec<u8>, cursors: &[Cursor]) {
    put_varint64(out, cursors.len() as u64);
    for cursor in cursors {
        put_length_prefixed(out, &cursor.source);
    }
    for cursor in cursors {
        put_varint64(out, cursor.seqno);
    }
}

fn get_cursors(dec: &mut Decoder<'_>) -> Result<Vec<Cursor>, ProtocolError> {
    let count = dec.get_varint64("cursor count")? as usize;
    let mut cursors = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        cursors.push(Cursor {
            source: dec.get_length_prefixed_bytes("cursor source")?,
            seqno: 0,
        });
    }
    for cursor in cursors.iter_mut() {
        cursor.seqno = dec.get_seqno("cursor seqno")?;
    }
    Ok(cursors)
}

fn put_properties(out: &mut Vec<u8>, properties: &[(Bytes, Bytes)]) {
    put_varint64(out, properties.len() as u64);
    for (key, value) in properties {
        put_length_prefixed(out, key);
        put_length_prefixed(out, value);
    }
}

fn get_properties(dec: &mut Decoder<'_>) -> Result<Vec<(Bytes, Bytes)>, ProtocolError> {
    let count = dec.get_varint64("property count")? as usize;
    let mut properties = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let key = dec.get_length_prefixed_bytes("property key")?;
        let value = dec.get_length_prefixed_bytes("property value")?;
        properties.push((key, value));
    }
    Ok(properties)
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Ping(_) => MessageType::Ping,
            Message::Data(data) => match data.data_type {
                DataMessageType::Publish => MessageType::Publish,
                DataMessageType::Deliver => MessageType::Deliver,
            },
            Message::DataAck(_) => MessageType::DataAck,
            Message::Gap(_) => MessageType::Gap,
            Message::Goodbye(_) => MessageType::Goodbye,
            Message::Subscribe(_) => MessageType::Subscribe,
            Message::Unsubscribe(_) => MessageType::Unsubscribe,
            Message::DeliverGap(_) => MessageType::DeliverGap,
            Message::DeliverData(_) => MessageType::DeliverData,
            Message::DeliverBatch(_) => MessageType::DeliverBatch,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::HeartbeatDelta(_) => MessageType::HeartbeatDelta,
            Message::FindTailSeqno(_) => MessageType::FindTailSeqno,
            Message::TailSeqno(_) => MessageType::TailSeqno,
            Message::BacklogQuery(_) => MessageType::BacklogQuery,
            Message::BacklogFill(_) => MessageType::BacklogFill,
            Message::Introduction(_) => MessageType::Introduction,
            Message::SubAck(_) => MessageType::SubAck,
        }
    }

    /// Serialise into `out`, appending.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.message_type() as u8);
        match self {
            Message::Ping(msg) => {
                put_fixed16(out, msg.tenant_id);
                out.push(msg.ping_type as u8);
                put_length_prefixed(out, &msg.cookie);
            }
            Message::Data(msg) => msg.encode(out),
            Message::DataAck(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_varint32(out, msg.acks.len() as u32);
                for ack in &msg.acks {
                    out.push(ack.status as u8);
                    out.extend_from_slice(&ack.msg_id.0);
                    put_varint64(out, ack.seqno);
                }
            }
            Message::Gap(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                out.push(msg.gap_type as u8);
                put_varint64(out, msg.from);
                put_varint64(out, msg.to);
            }
            Message::Goodbye(msg) => {
                put_fixed16(out, msg.tenant_id);
                out.push(msg.code as u8);
                out.push(msg.origin_type as u8);
            }
            Message::Subscribe(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                // Single start seqno first, for peers predating cursors.
                put_varint64(out, msg.start.first().map(|c| c.seqno).unwrap_or(0));
                put_subscription_id(out, msg.sub_id);
                put_cursors(out, &msg.start);
            }
            Message::Unsubscribe(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_subscription_id(out, msg.sub_id);
                out.push(msg.reason as u8);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
            }
            Message::DeliverGap(msg) => {
                put_deliver_header(out, msg.tenant_id, msg.sub_id, msg.prev_seqno, msg.seqno);
                out.push(msg.gap_type as u8);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                put_length_prefixed(out, &msg.source);
            }
            Message::DeliverData(msg) => {
                put_deliver_header(out, msg.tenant_id, msg.sub_id, msg.prev_seqno, msg.seqno);
                put_length_prefixed(out, &msg.msg_id.0);
                put_length_prefixed(out, &msg.payload);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                put_length_prefixed(out, &msg.source);
            }
            Message::DeliverBatch(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_varint64(out, msg.messages.len() as u64);
                let mut one = Vec::new();
                for data in &msg.messages {
                    one.clear();
                    Message::DeliverData(data.clone()).encode(&mut one);
                    put_length_prefixed(out, &one);
                }
            }
            Message::Heartbeat(msg) => {
                debug_assert!(msg.healthy_shards.windows(2).all(|w| w[0] < w[1]));
                put_fixed16(out, msg.tenant_id);
                put_fixed64(out, msg.timestamp_ms);
                for shard in &msg.healthy_shards {
                    put_varint32(out, *shard);
                }
            }
            Message::HeartbeatDelta(msg) => {
                debug_assert!(msg.added_healthy.windows(2).all(|w| w[0] < w[1]));
                debug_assert!(msg.removed_healthy.windows(2).all(|w| w[0] < w[1]));
                put_fixed16(out, msg.tenant_id);
                put_fixed64(out, msg.timestamp_ms);
                put_varint64(out, msg.added_healthy.len() as u64);
                for shard in &msg.added_healthy {
                    put_varint32(out, *shard);
                }
                put_varint64(out, msg.removed_healthy.len() as u64);
                for shard in &msg.removed_healthy {
                    put_varint32(out, *shard);
                }
            }
            Message::FindTailSeqno(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
            }
            Message::TailSeqno(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                put_varint64(out, msg.seqno);
            }
            Message::BacklogQuery(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_subscription_id(out, msg.sub_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                put_length_prefixed(out, &msg.source);
                put_varint64(out, msg.seqno);
            }
            Message::BacklogFill(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                put_length_prefixed(out, &msg.source);
                put_varint64(out, msg.prev_seqno);
                put_varint64(out, msg.next_seqno);
                out.push(msg.result as u8);
                put_length_prefixed(out, &msg.info);
            }
            Message::Introduction(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_properties(out, &msg.stream_properties);
                put_properties(out, &msg.client_properties);
            }
            Message::SubAck(msg) => {
                put_fixed16(out, msg.tenant_id);
                put_topic_id(out, &msg.namespace_id, &msg.topic);
                put_subscription_id(out, msg.sub_id);
                put_cursors(out, &msg.cursors);
            }
        }
    }

    /// Serialise into a fresh buffer.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        self.encode(&mut out);
        out
    }

    /// Parse a message. Unknown trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Message, ProtocolError> {
        let mut dec = Decoder::new(buf);
        let message_type = MessageType::try_from(dec.get_u8("message type")?)?;
        match message_type {
            MessageType::Ping => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let ping_type = PingType::try_from(dec.get_u8("ping type")?)?;
                let cookie = dec.get_length_prefixed_bytes("cookie")?;
                Ok(Message::Ping(MessagePing {
                    tenant_id,
                    ping_type,
                    cookie,
                }))
            }
            MessageType::Publish => Ok(Message::Data(MessageData::decode(
                &mut dec,
                DataMessageType::Publish,
            )?)),
            MessageType::Deliver => Ok(Message::Data(MessageData::decode(
                &mut dec,
                DataMessageType::Deliver,
            )?)),
            MessageType::DataAck => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let count = dec.get_varint32("ack count")? as usize;
                let mut acks = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let status = AckStatus::try_from(dec.get_u8("ack status")?)?;
                    let id_bytes = dec.get_bytes(16, "ack msg id")?;
                    let mut msg_id = MsgId::default();
                    msg_id.0.copy_from_slice(id_bytes);
                    let seqno = dec.get_seqno("ack seqno")?;
                    acks.push(Ack {
                        status,
                        msg_id,
                        seqno,
                    });
                }
                Ok(Message::DataAck(MessageDataAck { tenant_id, acks }))
            }
            MessageType::Gap => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                let gap_type = GapType::try_from(dec.get_u8("gap type")?)?;
                let from = dec.get_seqno("gap from")?;
                let to = dec.get_seqno("gap to")?;
                Ok(Message::Gap(MessageGap {
                    tenant_id,
                    namespace_id,
                    topic,
                    gap_type,
                    from,
                    to,
                }))
            }
            MessageType::Goodbye => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let code = GoodbyeCode::try_from(dec.get_u8("goodbye code")?)?;
                let origin_type = OriginType::try_from(dec.get_u8("origin type")?)?;
                Ok(Message::Goodbye(MessageGoodbye {
                    tenant_id,
                    code,
                    origin_type,
                }))
            }
            MessageType::Subscribe => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                let legacy_seqno = dec.get_seqno("start seqno")?;
                let sub_id = dec.get_subscription_id("sub id")?;
                // Cursor section may be absent in old messages.
                let start = match get_cursors(&mut dec) {
                    Ok(cursors) => cursors,
                    Err(_) => vec![Cursor::new(Bytes::new(), legacy_seqno)],
                };
                Ok(Message::Subscribe(MessageSubscribe {
                    tenant_id,
                    namespace_id,
                    topic,
                    sub_id,
                    start,
                }))
            }
            MessageType::Unsubscribe => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let sub_id = dec.get_subscription_id("sub id")?;
                let reason = UnsubscribeReason::try_from(dec.get_u8("reason")?)?;
                let (namespace_id, topic) = dec
                    .get_topic_id("topic id")
                    .unwrap_or((Bytes::new(), Bytes::new()));
                Ok(Message::Unsubscribe(MessageUnsubscribe {
                    tenant_id,
                    sub_id,
                    reason,
                    namespace_id,
                    topic,
                }))
            }
            MessageType::DeliverGap => {
                let (tenant_id, sub_id, prev_seqno, seqno) = get_deliver_header(&mut dec)?;
                let gap_type = GapType::try_from(dec.get_u8("gap type")?)?;
                let (namespace_id, topic) = dec
                    .get_topic_id("topic id")
                    .unwrap_or((Bytes::new(), Bytes::new()));
                let source = dec
                    .get_length_prefixed_bytes("source")
                    .unwrap_or_else(|_| Bytes::new());
                Ok(Message::DeliverGap(MessageDeliverGap {
                    tenant_id,
                    sub_id,
                    prev_seqno,
                    seqno,
                    gap_type,
                    namespace_id,
                    topic,
                    source,
                }))
            }
            MessageType::DeliverData => {
                let (tenant_id, sub_id, prev_seqno, seqno) = get_deliver_header(&mut dec)?;
                let id_bytes = dec.get_length_prefixed("msg id")?;
                if id_bytes.len() < 16 {
                    return Err(ProtocolError::Truncated("msg id"));
                }
                let mut msg_id = MsgId::default();
                msg_id.0.copy_from_slice(&id_bytes[..16]);
                let payload = dec.get_length_prefixed_bytes("payload")?;
                let (namespace_id, topic) = dec
                    .get_topic_id("topic id")
                    .unwrap_or((Bytes::new(), Bytes::new()));
                let source = dec
                    .get_length_prefixed_bytes("source")
                    .unwrap_or_else(|_| Bytes::new());
                Ok(Message::DeliverData(MessageDeliverData {
                    tenant_id,
                    sub_id,
                    prev_seqno,
                    seqno,
                    msg_id,
                    payload,
                    namespace_id,
                    topic,
                    source,
                }))
            }
            MessageType::DeliverBatch => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let count = dec.get_varint64("batch count")? as usize;
                let mut messages = Vec::with_capacity(count.min(64));
                for _ in 0..count {
                    let body = dec.get_length_prefixed("batch body")?;
                    match Message::decode(body)? {
                        Message::DeliverData(data) => messages.push(data),
                        _ => return Err(ProtocolError::Truncated("batch body")),
                    }
                }
                Ok(Message::DeliverBatch(MessageDeliverBatch {
                    tenant_id,
                    messages,
                }))
            }
            MessageType::Heartbeat => {
                let tenant_id = dec.get_fixed16("tenant")?;
                if dec.is_empty() {
                    // Old peers send an empty heartbeat body.
                    return Ok(Message::Heartbeat(MessageHeartbeat {
                        tenant_id,
                        timestamp_ms: 0,
                        healthy_shards: Vec::new(),
                    }));
                }
                let timestamp_ms = dec.get_fixed64("timestamp")?;
                let mut healthy_shards = Vec::new();
                while !dec.is_empty() {
                    healthy_shards.push(dec.get_varint32("shard")?);
                }
                Ok(Message::Heartbeat(MessageHeartbeat {
                    tenant_id,
                    timestamp_ms,
                    healthy_shards,
                }))
            }
            MessageType::HeartbeatDelta => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let timestamp_ms = dec.get_fixed64("timestamp")?;
                let num_added = dec.get_varint64("num added")? as usize;
                let mut added_healthy = Vec::with_capacity(num_added.min(1024));
                for _ in 0..num_added {
                    added_healthy.push(dec.get_varint32("added shard")?);
                }
                let num_removed = dec.get_varint64("num removed")? as usize;
                let mut removed_healthy = Vec::with_capacity(num_removed.min(1024));
                for _ in 0..num_removed {
                    removed_healthy.push(dec.get_varint32("removed shard")?);
                }
                Ok(Message::HeartbeatDelta(MessageHeartbeatDelta {
                    tenant_id,
                    timestamp_ms,
                    added_healthy,
                    removed_healthy,
                }))
            }
            MessageType::FindTailSeqno => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                Ok(Message::FindTailSeqno(MessageFindTailSeqno {
                    tenant_id,
                    namespace_id,
                    topic,
                }))
            }
            MessageType::TailSeqno => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                let seqno = dec.get_seqno("seqno")?;
                Ok(Message::TailSeqno(MessageTailSeqno {
                    tenant_id,
                    namespace_id,
                    topic,
                    seqno,
                }))
            }
            MessageType::BacklogQuery => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let sub_id = dec.get_subscription_id("sub id")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                let source = dec.get_length_prefixed_bytes("source")?;
                let seqno = dec.get_seqno("seqno")?;
                Ok(Message::BacklogQuery(MessageBacklogQuery {
                    tenant_id,
                    sub_id,
                    namespace_id,
                    topic,
                    source,
                    seqno,
                }))
            }
            MessageType::BacklogFill => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                let source = dec.get_length_prefixed_bytes("source")?;
                let prev_seqno = dec.get_seqno("prev seqno")?;
                let next_seqno = dec.get_seqno("next seqno")?;
                let result = FillResult::try_from(dec.get_u8("fill result")?)?;
                // Info may be absent in old messages.
                let info = dec
                    .get_length_prefixed_bytes("info")
                    .unwrap_or_else(|_| Bytes::new());
                Ok(Message::BacklogFill(MessageBacklogFill {
                    tenant_id,
                    namespace_id,
                    topic,
                    source,
                    prev_seqno,
                    next_seqno,
                    result,
                    info,
                }))
            }
            MessageType::Introduction => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let stream_properties = get_properties(&mut dec)?;
                let client_properties = get_properties(&mut dec)?;
                Ok(Message::Introduction(MessageIntroduction {
                    tenant_id,
                    stream_properties,
                    client_properties,
                }))
            }
            MessageType::SubAck => {
                let tenant_id = dec.get_fixed16("tenant")?;
                let (namespace_id, topic) = dec.get_topic_id("topic id")?;
                let sub_id = dec.get_subscription_id("sub id")?;
                let cursors = get_cursors(&mut dec)?;
                Ok(Message::SubAck(MessageSubAck {
                    tenant_id,
                    namespace_id,
                    topic,
                    sub_id,
                    cursors,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let encoded = msg.encode_to_vec();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    fn sample_msg_id(seed: u8) -> MsgId {
        let mut id = MsgId::default();
        for (i, b) in id.0.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        id
    }

    #[test]
    fn test_roundtrip_ping() {
        roundtrip(Message::Ping(MessagePing {
            tenant_id: 102,
            ping_type: PingType::Request,
            cookie: Bytes::from_static(b"cookie"),
        }));
    }

    #[test]
    fn test_roundtrip_data() {
        let mut data = MessageData::new(
            DataMessageType::Deliver,
            102,
            Bytes::from_static(b"102"),
            Bytes::from_static(b"test_topic"),
            sample_msg_id(7),
            Bytes::from_static(b"test_message"),
        );
        data.set_sequence_numbers(41, 42);
        roundtrip(Message::Data(data));
    }

    #[test]
    fn test_data_storage_roundtrip() {
        let mut data = MessageData::new(
            DataMessageType::Publish,
            1,
            Bytes::from_static(b"ns"),
            Bytes::from_static(b"topic"),
            sample_msg_id(3),
            Bytes::from_static(b"payload"),
        );
        data.set_sequence_numbers(9, 10);

        let mut storage = Vec::new();
        data.encode_storage(&mut storage);
        let parsed = MessageData::decode_storage(&storage, DataMessageType::Publish).unwrap();
        // The storage section does not carry sequence numbers.
        assert_eq!(parsed.seqno, 0);
        assert_eq!(parsed.payload, data.payload);
        assert_eq!(parsed.topic, data.topic);
        assert_eq!(parsed.msg_id, data.msg_id);
    }

    #[test]
    fn test_roundtrip_data_ack() {
        roundtrip(Message::DataAck(MessageDataAck {
            tenant_id: 3,
            acks: vec![
                Ack {
                    status: AckStatus::Success,
                    msg_id: sample_msg_id(1),
                    seqno: 100,
                },
                Ack {
                    status: AckStatus::Failure,
                    msg_id: sample_msg_id(2),
                    seqno: 0,
                },
            ],
        }));
    }

    #[test]
    fn test_roundtrip_gap() {
        roundtrip(Message::Gap(MessageGap {
            tenant_id: 1,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            gap_type: GapType::Retention,
            from: 10,
            to: 20,
        }));
    }

    #[test]
    fn test_roundtrip_goodbye() {
        roundtrip(Message::Goodbye(MessageGoodbye {
            tenant_id: 1,
            code: GoodbyeCode::Graceful,
            origin_type: OriginType::Client,
        }));
    }

    #[test]
    fn test_roundtrip_subscribe() {
        roundtrip(Message::Subscribe(MessageSubscribe {
            tenant_id: 102,
            namespace_id: Bytes::from_static(b"102"),
            topic: Bytes::from_static(b"test_topic"),
            sub_id: (3u64 << 56) | 17,
            start: vec![
                Cursor::new(Bytes::new(), 1),
                Cursor::new(Bytes::from_static(b"src"), 55),
            ],
        }));
    }

    #[test]
    fn test_subscribe_legacy_without_cursors() {
        // Encode by hand the way an old peer would: no cursor section.
        let mut buf = Vec::new();
        buf.push(MessageType::Subscribe as u8);
        put_fixed16(&mut buf, 7);
        put_topic_id(&mut buf, b"ns", b"topic");
        put_varint64(&mut buf, 42); // legacy start seqno
        put_subscription_id(&mut buf, 5);

        match Message::decode(&buf).unwrap() {
            Message::Subscribe(msg) => {
                assert_eq!(msg.sub_id, 5);
                assert_eq!(msg.start, vec![Cursor::new(Bytes::new(), 42)]);
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_unsubscribe() {
        roundtrip(Message::Unsubscribe(MessageUnsubscribe {
            tenant_id: 1,
            sub_id: 9,
            reason: UnsubscribeReason::Invalid,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
        }));
    }

    #[test]
    fn test_unsubscribe_legacy_without_topic() {
        let mut buf = Vec::new();
        buf.push(MessageType::Unsubscribe as u8);
        put_fixed16(&mut buf, 1);
        put_subscription_id(&mut buf, 9);
        buf.push(UnsubscribeReason::Requested as u8);

        match Message::decode(&buf).unwrap() {
            Message::Unsubscribe(msg) => {
                assert!(msg.namespace_id.is_empty());
                assert!(msg.topic.is_empty());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_deliver_gap() {
        roundtrip(Message::DeliverGap(MessageDeliverGap {
            tenant_id: 1,
            sub_id: 77,
            prev_seqno: 10,
            seqno: 20,
            gap_type: GapType::Benign,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            source: Bytes::from_static(b"src"),
        }));
    }

    #[test]
    fn test_roundtrip_deliver_data() {
        roundtrip(Message::DeliverData(MessageDeliverData {
            tenant_id: 1,
            sub_id: 77,
            prev_seqno: 99,
            seqno: 100,
            msg_id: sample_msg_id(9),
            payload: Bytes::from_static(b"payload"),
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            source: Bytes::from_static(b""),
        }));
    }

    #[test]
    fn test_deliver_header_uses_difference_encoding() {
        let msg = Message::DeliverGap(MessageDeliverGap {
            tenant_id: 0,
            sub_id: 1,
            prev_seqno: 1_000_000,
            seqno: 1_000_001,
            gap_type: GapType::Benign,
            namespace_id: Bytes::new(),
            topic: Bytes::new(),
            source: Bytes::new(),
        });
        let encoded = msg.encode_to_vec();
        // type + tenant + sub id + varint(prev) + varint(diff=1): the diff
        // must encode as a single byte despite the large absolute seqno.
        let mut dec = Decoder::new(&encoded[3..]);
        dec.get_subscription_id("sub").unwrap();
        dec.get_varint64("prev").unwrap();
        assert_eq!(dec.get_varint64("diff").unwrap(), 1);
    }

    #[test]
    fn test_roundtrip_deliver_batch() {
        let item = |seqno| MessageDeliverData {
            tenant_id: 1,
            sub_id: 5,
            prev_seqno: seqno - 1,
            seqno,
            msg_id: sample_msg_id(seqno as u8),
            payload: Bytes::from_static(b"x"),
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            source: Bytes::new(),
        };
        roundtrip(Message::DeliverBatch(MessageDeliverBatch {
            tenant_id: 1,
            messages: vec![item(10), item(11), item(12)],
        }));
    }

    #[test]
    fn test_roundtrip_heartbeat() {
        roundtrip(Message::Heartbeat(MessageHeartbeat {
            tenant_id: 1,
            timestamp_ms: 1234567890,
            healthy_shards: vec![1, 5, 130, 20000],
        }));
    }

    #[test]
    fn test_heartbeat_empty_body() {
        let mut buf = Vec::new();
        buf.push(MessageType::Heartbeat as u8);
        put_fixed16(&mut buf, 2);
        match Message::decode(&buf).unwrap() {
            Message::Heartbeat(msg) => {
                assert_eq!(msg.timestamp_ms, 0);
                assert!(msg.healthy_shards.is_empty());
            }
            other => panic!("wrong message: {:?}", other),
        }
    }

    #[test]
    fn test_roundtrip_heartbeat_delta() {
        roundtrip(Message::HeartbeatDelta(MessageHeartbeatDelta {
            tenant_id: 1,
            timestamp_ms: 77,
            added_healthy: vec![2, 3],
            removed_healthy: vec![9],
        }));
    }

    #[test]
    fn test_roundtrip_tail_seqno() {
        roundtrip(Message::FindTailSeqno(MessageFindTailSeqno {
            tenant_id: 1,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
        }));
        roundtrip(Message::TailSeqno(MessageTailSeqno {
            tenant_id: 1,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            seqno: 12345,
        }));
    }

    #[test]
    fn test_roundtrip_backlog() {
        roundtrip(Message::BacklogQuery(MessageBacklogQuery {
            tenant_id: 1,
            sub_id: 3,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            source: Bytes::from_static(b"src"),
            seqno: 5,
        }));
        roundtrip(Message::BacklogFill(MessageBacklogFill {
            tenant_id: 1,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            source: Bytes::from_static(b"src"),
            prev_seqno: 5,
            next_seqno: 10,
            result: FillResult::Partial,
            info: Bytes::from_static(b"info"),
        }));
    }

    #[test]
    fn test_roundtrip_introduction() {
        roundtrip(Message::Introduction(MessageIntroduction {
            tenant_id: 1,
            stream_properties: vec![(
                Bytes::from_static(b"shard"),
                Bytes::from_static(b"3"),
            )],
            client_properties: vec![(
                Bytes::from_static(b"client_id"),
                Bytes::from_static(b"worker-0"),
            )],
        }));
    }

    #[test]
    fn test_roundtrip_sub_ack() {
        roundtrip(Message::SubAck(MessageSubAck {
            tenant_id: 1,
            namespace_id: Bytes::from_static(b"ns"),
            topic: Bytes::from_static(b"t"),
            sub_id: 8,
            cursors: vec![Cursor::new(Bytes::new(), 4)],
        }));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(Message::decode(&[0x63, 0, 0]).is_err());
        assert!(Message::decode(&[]).is_err());
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let msg = Message::Goodbye(MessageGoodbye {
            tenant_id: 1,
            code: GoodbyeCode::SocketError,
            origin_type: OriginType::Server,
        });
        let mut encoded = msg.encode_to_vec();
        encoded.extend_from_slice(b"future fields");
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }
}
