//! Command tag catalogue. Values are part of the wire contract and frozen.

/// A closed set of wire command tags, with `Unknown` absorbing anything
/// the decoder doesn't recognize (future commands, or a peer on a newer
/// protocol revision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    HeartbeatReq,
    HeartbeatRsp,
    AuthReq,
    AuthRsp,
    KickOut,
    SendMsgReq,
    SendMsgRsp,
    PushMsg,
    BatchMsg,
    RevokeReq,
    RevokeRsp,
    RevokePush,
    SyncReq,
    SyncRsp,
    SyncRangeReq,
    SyncRangeRsp,
    ReadReceiptReq,
    ReadReceiptRsp,
    ReadReceiptPush,
    TypingPush,
    /// Anything not in the table above. Logged and dropped by the router.
    Unknown(u16),
}

impl Tag {
    pub fn from_u16(v: u16) -> Self {
        match v {
            5 => Tag::HeartbeatReq,
            6 => Tag::HeartbeatRsp,
            100 => Tag::AuthReq,
            101 => Tag::AuthRsp,
            104 => Tag::KickOut,
            200 => Tag::SendMsgReq,
            201 => Tag::SendMsgRsp,
            202 => Tag::PushMsg,
            204 => Tag::BatchMsg,
            205 => Tag::RevokeReq,
            206 => Tag::RevokeRsp,
            207 => Tag::RevokePush,
            300 => Tag::SyncReq,
            301 => Tag::SyncRsp,
            303 => Tag::SyncRangeReq,
            304 => Tag::SyncRangeRsp,
            500 => Tag::ReadReceiptReq,
            501 => Tag::ReadReceiptRsp,
            502 => Tag::ReadReceiptPush,
            601 => Tag::TypingPush,
            other => Tag::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Tag::HeartbeatReq => 5,
            Tag::HeartbeatRsp => 6,
            Tag::AuthReq => 100,
            Tag::AuthRsp => 101,
            Tag::KickOut => 104,
            Tag::SendMsgReq => 200,
            Tag::SendMsgRsp => 201,
            Tag::PushMsg => 202,
            Tag::BatchMsg => 204,
            Tag::RevokeReq => 205,
            Tag::RevokeRsp => 206,
            Tag::RevokePush => 207,
            Tag::SyncReq => 300,
            Tag::SyncRsp => 301,
            Tag::SyncRangeReq => 303,
            Tag::SyncRangeRsp => 304,
            Tag::ReadReceiptReq => 500,
            Tag::ReadReceiptRsp => 501,
            Tag::ReadReceiptPush => 502,
            Tag::TypingPush => 601,
            Tag::Unknown(v) => v,
        }
    }

    /// A request frame that expects a response sharing the same `sequence`.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Tag::HeartbeatReq
                | Tag::AuthReq
                | Tag::SendMsgReq
                | Tag::RevokeReq
                | Tag::SyncReq
                | Tag::SyncRangeReq
                | Tag::ReadReceiptReq
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_tags() {
        for v in [5, 6, 100, 101, 104, 200, 201, 202, 204, 205, 206, 207, 300, 301, 303, 304, 500,
            501, 502, 601]
        {
            assert_eq!(Tag::from_u16(v).to_u16(), v);
        }
    }

    #[test]
    fn unknown_tag_round_trips() {
        let t = Tag::from_u16(9999);
        assert!(matches!(t, Tag::Unknown(9999)));
        assert_eq!(t.to_u16(), 9999);
    }
}
