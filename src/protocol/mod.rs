//! MQTT-SN datagram protocol: message types and their wire codec.
//!
//! Every datagram carries exactly one message. The framing is a 1-byte
//! length prefix (or `0x01` + 2-byte length for large messages) followed by
//! a message-type octet and the type-specific body.

pub mod codec;

use bytes::Bytes;

use codec::{put_u16, read_frame, read_str, read_u16, read_u8, write_frame};

/// Topic carried by name in SUBSCRIBE/UNSUBSCRIBE (`topic_id_type == 0`).
pub const TOPIC_ID_TYPE_NORMAL: u8 = 0x00;
/// Pre-defined topic id (`topic_id_type == 1`).
pub const TOPIC_ID_TYPE_PREDEFINED: u8 = 0x01;
/// Short topic name packed into the id field (`topic_id_type == 2`).
pub const TOPIC_ID_TYPE_SHORT: u8 = 0x02;

/// Decoding failure for an incoming datagram.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Datagram ends before the message does.
    #[error("datagram truncated: {needed} more bytes needed")]
    Truncated { needed: usize },

    /// Length prefix disagrees with the datagram size.
    #[error("length prefix {length} does not match datagram size {actual}")]
    LengthMismatch { length: usize, actual: usize },

    /// Message-type octet is not one this gateway knows.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMsgType(u8),

    /// A topic or client id field is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Message type octet values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Advertise = 0x00,
    SearchGw = 0x01,
    GwInfo = 0x02,
    Connect = 0x04,
    ConnAck = 0x05,
    WillTopicReq = 0x06,
    WillTopic = 0x07,
    WillMsgReq = 0x08,
    WillMsg = 0x09,
    Register = 0x0A,
    RegAck = 0x0B,
    Publish = 0x0C,
    PubAck = 0x0D,
    PubComp = 0x0E,
    PubRec = 0x0F,
    PubRel = 0x10,
    Subscribe = 0x12,
    SubAck = 0x13,
    Unsubscribe = 0x14,
    UnsubAck = 0x15,
    PingReq = 0x16,
    PingResp = 0x17,
    Disconnect = 0x18,
    WillTopicUpd = 0x1A,
    WillTopicResp = 0x1B,
    WillMsgUpd = 0x1C,
    WillMsgResp = 0x1D,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        use MsgType::*;
        Some(match value {
            0x00 => Advertise,
            0x01 => SearchGw,
            0x02 => GwInfo,
            0x04 => Connect,
            0x05 => ConnAck,
            0x06 => WillTopicReq,
            0x07 => WillTopic,
            0x08 => WillMsgReq,
            0x09 => WillMsg,
            0x0A => Register,
            0x0B => RegAck,
            0x0C => Publish,
            0x0D => PubAck,
            0x0E => PubComp,
            0x0F => PubRec,
            0x10 => PubRel,
            0x12 => Subscribe,
            0x13 => SubAck,
            0x14 => Unsubscribe,
            0x15 => UnsubAck,
            0x16 => PingReq,
            0x17 => PingResp,
            0x18 => Disconnect,
            0x1A => WillTopicUpd,
            0x1B => WillTopicResp,
            0x1C => WillMsgUpd,
            0x1D => WillMsgResp,
            _ => return None,
        })
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Return code carried by the ack messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReturnCode {
    #[default]
    Accepted = 0x00,
    Congestion = 0x01,
    InvalidTopicId = 0x02,
    NotSupported = 0x03,
}

impl ReturnCode {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => ReturnCode::Accepted,
            0x01 => ReturnCode::Congestion,
            0x02 => ReturnCode::InvalidTopicId,
            _ => ReturnCode::NotSupported,
        }
    }
}

/// Flags octet shared by CONNECT, WILLTOPIC*, PUBLISH, SUBSCRIBE,
/// UNSUBSCRIBE and SUBACK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    pub dup: bool,
    /// 2-bit QoS field; `0b11` encodes QoS -1.
    pub qos: u8,
    pub retain: bool,
    pub will: bool,
    pub clean_session: bool,
    pub topic_id_type: u8,
}

impl Flags {
    pub fn decode(value: u8) -> Self {
        Self {
            dup: value & 0x80 != 0,
            qos: (value >> 5) & 0x03,
            retain: value & 0x10 != 0,
            will: value & 0x08 != 0,
            clean_session: value & 0x04 != 0,
            topic_id_type: value & 0x03,
        }
    }

    pub fn encode(&self) -> u8 {
        let mut value = (self.qos & 0x03) << 5 | self.topic_id_type & 0x03;
        if self.dup {
            value |= 0x80;
        }
        if self.retain {
            value |= 0x10;
        }
        if self.will {
            value |= 0x08;
        }
        if self.clean_session {
            value |= 0x04;
        }
        value
    }
}

/// CONNECT body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub flags: Flags,
    pub protocol_id: u8,
    pub duration: u16,
    pub client_id: String,
}

/// REGISTER body (either direction).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub topic_id: u16,
    pub msg_id: u16,
    pub topic: String,
}

/// REGACK body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegAck {
    pub topic_id: u16,
    pub msg_id: u16,
    pub code: ReturnCode,
}

/// PUBLISH body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub payload: Bytes,
}

/// Topic reference in SUBSCRIBE/UNSUBSCRIBE, discriminated by
/// `flags.topic_id_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSpec {
    /// Full topic name or wildcard pattern (`topic_id_type == 0`).
    Name(String),
    /// Pre-defined or short topic id.
    Id(u16),
}

/// SUBSCRIBE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub flags: Flags,
    pub msg_id: u16,
    pub topic: TopicSpec,
}

/// SUBACK body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck {
    pub flags: Flags,
    pub topic_id: u16,
    pub msg_id: u16,
    pub code: ReturnCode,
}

/// UNSUBSCRIBE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub flags: Flags,
    pub msg_id: u16,
    pub topic: TopicSpec,
}

/// A single decoded datagram message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Advertise { gw_id: u8, duration: u16 },
    SearchGw { radius: u8 },
    GwInfo { gw_id: u8, gw_addr: Bytes },
    Connect(Connect),
    ConnAck { code: ReturnCode },
    WillTopicReq,
    WillTopic { flags: Flags, topic: String },
    WillMsgReq,
    WillMsg { message: Bytes },
    Register(Register),
    RegAck(RegAck),
    Publish(Publish),
    PubAck { topic_id: u16, msg_id: u16, code: ReturnCode },
    PubRec { msg_id: u16 },
    PubRel { msg_id: u16 },
    PubComp { msg_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { msg_id: u16 },
    PingReq { client_id: Option<String> },
    PingResp,
    Disconnect { duration: Option<u16> },
    WillTopicUpd { flags: Flags, topic: String },
    WillTopicResp { code: ReturnCode },
    WillMsgUpd { message: Bytes },
    WillMsgResp { code: ReturnCode },
}

impl Message {
    /// The message-type tag of this message.
    pub fn msg_type(&self) -> MsgType {
        use Message::*;
        match self {
            Advertise { .. } => MsgType::Advertise,
            SearchGw { .. } => MsgType::SearchGw,
            GwInfo { .. } => MsgType::GwInfo,
            Connect(_) => MsgType::Connect,
            ConnAck { .. } => MsgType::ConnAck,
            WillTopicReq => MsgType::WillTopicReq,
            WillTopic { .. } => MsgType::WillTopic,
            WillMsgReq => MsgType::WillMsgReq,
            WillMsg { .. } => MsgType::WillMsg,
            Register(_) => MsgType::Register,
            RegAck(_) => MsgType::RegAck,
            Publish(_) => MsgType::Publish,
            PubAck { .. } => MsgType::PubAck,
            PubRec { .. } => MsgType::PubRec,
            PubRel { .. } => MsgType::PubRel,
            PubComp { .. } => MsgType::PubComp,
            Subscribe(_) => MsgType::Subscribe,
            SubAck(_) => MsgType::SubAck,
            Unsubscribe(_) => MsgType::Unsubscribe,
            UnsubAck { .. } => MsgType::UnsubAck,
            PingReq { .. } => MsgType::PingReq,
            PingResp => MsgType::PingResp,
            Disconnect { .. } => MsgType::Disconnect,
            WillTopicUpd { .. } => MsgType::WillTopicUpd,
            WillTopicResp { .. } => MsgType::WillTopicResp,
            WillMsgUpd { .. } => MsgType::WillMsgUpd,
            WillMsgResp { .. } => MsgType::WillMsgResp,
        }
    }

    /// Decode a complete datagram into a message.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        let (type_octet, body) = read_frame(buf)?;
        let msg_type = MsgType::from_u8(type_octet)
            .ok_or(DecodeError::UnknownMsgType(type_octet))?;

        let msg = match msg_type {
            MsgType::Advertise => Message::Advertise {
                gw_id: read_u8(body)?,
                duration: read_u16(&body[1..])?,
            },
            MsgType::SearchGw => Message::SearchGw { radius: read_u8(body)? },
            MsgType::GwInfo => Message::GwInfo {
                gw_id: read_u8(body)?,
                gw_addr: Bytes::copy_from_slice(&body[1..]),
            },
            MsgType::Connect => {
                let flags = Flags::decode(read_u8(body)?);
                let protocol_id = read_u8(&body[1..])?;
                let duration = read_u16(&body[2..])?;
                let client_id = read_str(&body[4..])?.to_string();
                Message::Connect(Connect { flags, protocol_id, duration, client_id })
            }
            MsgType::ConnAck => Message::ConnAck {
                code: ReturnCode::from_u8(read_u8(body)?),
            },
            MsgType::WillTopicReq => Message::WillTopicReq,
            MsgType::WillTopic => {
                // An empty body is a will-topic deletion.
                if body.is_empty() {
                    Message::WillTopic { flags: Flags::default(), topic: String::new() }
                } else {
                    Message::WillTopic {
                        flags: Flags::decode(body[0]),
                        topic: read_str(&body[1..])?.to_string(),
                    }
                }
            }
            MsgType::WillMsgReq => Message::WillMsgReq,
            MsgType::WillMsg => Message::WillMsg { message: Bytes::copy_from_slice(body) },
            MsgType::Register => Message::Register(Register {
                topic_id: read_u16(body)?,
                msg_id: read_u16(&body[2..])?,
                topic: read_str(&body[4..])?.to_string(),
            }),
            MsgType::RegAck => Message::RegAck(RegAck {
                topic_id: read_u16(body)?,
                msg_id: read_u16(&body[2..])?,
                code: ReturnCode::from_u8(read_u8(&body[4..])?),
            }),
            MsgType::Publish => Message::Publish(Publish {
                flags: Flags::decode(read_u8(body)?),
                topic_id: read_u16(&body[1..])?,
                msg_id: read_u16(&body[3..])?,
                payload: Bytes::copy_from_slice(body.get(5..).unwrap_or_default()),
            }),
            MsgType::PubAck => Message::PubAck {
                topic_id: read_u16(body)?,
                msg_id: read_u16(&body[2..])?,
                code: ReturnCode::from_u8(read_u8(&body[4..])?),
            },
            MsgType::PubRec => Message::PubRec { msg_id: read_u16(body)? },
            MsgType::PubRel => Message::PubRel { msg_id: read_u16(body)? },
            MsgType::PubComp => Message::PubComp { msg_id: read_u16(body)? },
            MsgType::Subscribe => {
                let flags = Flags::decode(read_u8(body)?);
                let msg_id = read_u16(&body[1..])?;
                let topic = read_topic_spec(&flags, &body[3..])?;
                Message::Subscribe(Subscribe { flags, msg_id, topic })
            }
            MsgType::SubAck => Message::SubAck(SubAck {
                flags: Flags::decode(read_u8(body)?),
                topic_id: read_u16(&body[1..])?,
                msg_id: read_u16(&body[3..])?,
                code: ReturnCode::from_u8(read_u8(&body[5..])?),
            }),
            MsgType::Unsubscribe => {
                let flags = Flags::decode(read_u8(body)?);
                let msg_id = read_u16(&body[1..])?;
                let topic = read_topic_spec(&flags, &body[3..])?;
                Message::Unsubscribe(Unsubscribe { flags, msg_id, topic })
            }
            MsgType::UnsubAck => Message::UnsubAck { msg_id: read_u16(body)? },
            MsgType::PingReq => Message::PingReq {
                client_id: if body.is_empty() {
                    None
                } else {
                    Some(read_str(body)?.to_string())
                },
            },
            MsgType::PingResp => Message::PingResp,
            MsgType::Disconnect => Message::Disconnect {
                duration: if body.is_empty() { None } else { Some(read_u16(body)?) },
            },
            MsgType::WillTopicUpd => {
                if body.is_empty() {
                    Message::WillTopicUpd { flags: Flags::default(), topic: String::new() }
                } else {
                    Message::WillTopicUpd {
                        flags: Flags::decode(body[0]),
                        topic: read_str(&body[1..])?.to_string(),
                    }
                }
            }
            MsgType::WillTopicResp => Message::WillTopicResp {
                code: ReturnCode::from_u8(read_u8(body)?),
            },
            MsgType::WillMsgUpd => Message::WillMsgUpd { message: Bytes::copy_from_slice(body) },
            MsgType::WillMsgResp => Message::WillMsgResp {
                code: ReturnCode::from_u8(read_u8(body)?),
            },
        };

        Ok(msg)
    }

    /// Encode this message into a framed datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();

        match self {
            Message::Advertise { gw_id, duration } => {
                body.push(*gw_id);
                put_u16(&mut body, *duration);
            }
            Message::SearchGw { radius } => body.push(*radius),
            Message::GwInfo { gw_id, gw_addr } => {
                body.push(*gw_id);
                body.extend_from_slice(gw_addr);
            }
            Message::Connect(c) => {
                body.push(c.flags.encode());
                body.push(c.protocol_id);
                put_u16(&mut body, c.duration);
                body.extend_from_slice(c.client_id.as_bytes());
            }
            Message::ConnAck { code } => body.push(*code as u8),
            Message::WillTopicReq | Message::WillMsgReq | Message::PingResp => {}
            Message::WillTopic { flags, topic } | Message::WillTopicUpd { flags, topic } => {
                if !topic.is_empty() {
                    body.push(flags.encode());
                    body.extend_from_slice(topic.as_bytes());
                }
            }
            Message::WillMsg { message } | Message::WillMsgUpd { message } => {
                body.extend_from_slice(message);
            }
            Message::Register(r) => {
                put_u16(&mut body, r.topic_id);
                put_u16(&mut body, r.msg_id);
                body.extend_from_slice(r.topic.as_bytes());
            }
            Message::RegAck(r) => {
                put_u16(&mut body, r.topic_id);
                put_u16(&mut body, r.msg_id);
                body.push(r.code as u8);
            }
            Message::Publish(p) => {
                body.push(p.flags.encode());
                put_u16(&mut body, p.topic_id);
                put_u16(&mut body, p.msg_id);
                body.extend_from_slice(&p.payload);
            }
            Message::PubAck { topic_id, msg_id, code } => {
                put_u16(&mut body, *topic_id);
                put_u16(&mut body, *msg_id);
                body.push(*code as u8);
            }
            Message::PubRec { msg_id } => put_u16(&mut body, *msg_id),
            Message::PubRel { msg_id } => put_u16(&mut body, *msg_id),
            Message::PubComp { msg_id } => put_u16(&mut body, *msg_id),
            Message::Subscribe(s) => {
                body.push(s.flags.encode());
                put_u16(&mut body, s.msg_id);
                write_topic_spec(&mut body, &s.topic);
            }
            Message::SubAck(s) => {
                body.push(s.flags.encode());
                put_u16(&mut body, s.topic_id);
                put_u16(&mut body, s.msg_id);
                body.push(s.code as u8);
            }
            Message::Unsubscribe(u) => {
                body.push(u.flags.encode());
                put_u16(&mut body, u.msg_id);
                write_topic_spec(&mut body, &u.topic);
            }
            Message::UnsubAck { msg_id } => put_u16(&mut body, *msg_id),
            Message::PingReq { client_id } => {
                if let Some(id) = client_id {
                    body.extend_from_slice(id.as_bytes());
                }
            }
            Message::Disconnect { duration } => {
                if let Some(d) = duration {
                    put_u16(&mut body, *d);
                }
            }
            Message::WillTopicResp { code } | Message::WillMsgResp { code } => {
                body.push(*code as u8);
            }
        }

        write_frame(self.msg_type() as u8, &body)
    }
}

fn read_topic_spec(flags: &Flags, buf: &[u8]) -> Result<TopicSpec, DecodeError> {
    match flags.topic_id_type {
        TOPIC_ID_TYPE_PREDEFINED | TOPIC_ID_TYPE_SHORT => Ok(TopicSpec::Id(read_u16(buf)?)),
        _ => Ok(TopicSpec::Name(read_str(buf)?.to_string())),
    }
}

fn write_topic_spec(body: &mut Vec<u8>, topic: &TopicSpec) {
    match topic {
        TopicSpec::Name(name) => body.extend_from_slice(name.as_bytes()),
        TopicSpec::Id(id) => put_u16(body, *id),
    }
}
