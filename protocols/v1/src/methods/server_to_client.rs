use serde_json::{
    Value,
    Value::{Array as JArray, Bool as JBool, Number as JNumber, String as JString},
};
use std::convert::{TryFrom, TryInto};

use crate::{
    json_rpc::{Message, Notification, Response},
    methods::{MethodError, ParsingMethodError},
    utils::{HexBytes, HexU32Be, PrevHash},
};

/// _mining.notify(...)_
///
/// Fields in order:
///
/// * Job ID: included when miners submit a result so work can be matched with
///   the job it was produced for.
/// * Hash of previous block.
/// * Generation transaction (part 1): the miner inserts ExtraNonce1 and
///   ExtraNonce2 after this section of the transaction data.
/// * Generation transaction (part 2): appended after the two ExtraNonce values.
/// * List of merkle branches: the generation transaction is hashed against the
///   merkle branches to build the final merkle root.
/// * Block version, nBits, nTime: header fields.
/// * Clean Jobs: if true, miners should abort their current work and
///   immediately use the new job.
#[derive(Debug, Clone, PartialEq)]
pub struct Notify {
    pub job_id: String,
    pub prev_hash: PrevHash,
    pub coin_base1: HexBytes,
    pub coin_base2: HexBytes,
    pub merkle_branch: Vec<HexBytes>,
    pub version: HexU32Be,
    pub bits: HexU32Be,
    pub time: HexU32Be,
    pub clean_jobs: bool,
}

impl From<Notify> for Message {
    fn from(notify: Notify) -> Self {
        let merkle_branch = JArray(
            notify
                .merkle_branch
                .into_iter()
                .map(Into::into)
                .collect(),
        );
        Message::Notification(Notification {
            method: "mining.notify".to_string(),
            parameters: (&[
                notify.job_id.into(),
                notify.prev_hash.into(),
                notify.coin_base1.into(),
                notify.coin_base2.into(),
                merkle_branch,
                notify.version.into(),
                notify.bits.into(),
                notify.time.into(),
                notify.clean_jobs.into(),
            ][..])
                .into(),
        })
    }
}

impl TryFrom<Notification> for Notify {
    type Error = MethodError;

    fn try_from(msg: Notification) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let (job_id, prev_hash, coin_base1, coin_base2, merkle_branch_, version, bits, time, clean)
            = match &params[..] {
            [JString(a), JString(b), JString(c), JString(d), JArray(e), JString(f), JString(g), JString(h), JBool(i)] => {
                (
                    a.into(),
                    b.as_str().try_into()?,
                    c.as_str().try_into()?,
                    d.as_str().try_into()?,
                    e,
                    f.as_str().try_into()?,
                    g.as_str().try_into()?,
                    h.as_str().try_into()?,
                    *i,
                )
            }
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        let mut merkle_branch = vec![];
        for h in merkle_branch_ {
            let h: HexBytes = h
                .as_str()
                .ok_or_else(|| ParsingMethodError::not_string_from_value(h.clone()))?
                .try_into()?;
            merkle_branch.push(h);
        }
        Ok(Notify {
            job_id,
            prev_hash,
            coin_base1,
            coin_base2,
            merkle_branch,
            version,
            bits,
            time,
            clean_jobs: clean,
        })
    }
}

/// _mining.set_difficulty(difficulty)_
///
/// The server can adjust the difficulty required for miner shares. The miner
/// should begin enforcing the new difficulty on the next job received.
#[derive(Debug, Clone, PartialEq)]
pub struct SetDifficulty {
    pub value: f64,
}

impl From<SetDifficulty> for Message {
    fn from(sd: SetDifficulty) -> Self {
        let value: Value = sd.value.into();
        Message::Notification(Notification {
            method: "mining.set_difficulty".to_string(),
            parameters: (&[value][..]).into(),
        })
    }
}

impl TryFrom<Notification> for SetDifficulty {
    type Error = MethodError;

    fn try_from(msg: Notification) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let value = match &params[..] {
            [a] => a
                .as_f64()
                .ok_or_else(|| ParsingMethodError::not_float_from_value(a.clone()))?,
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        Ok(SetDifficulty { value })
    }
}

/// _mining.set_extranonce("extranonce1", extranonce2_size)_
///
/// These values, when provided, replace the initial subscription values
/// beginning with the next mining.notify job.
#[derive(Debug, Clone, PartialEq)]
pub struct SetExtranonce {
    pub extra_nonce1: HexBytes,
    pub extra_nonce2_size: usize,
}

impl From<SetExtranonce> for Message {
    fn from(se: SetExtranonce) -> Self {
        let extra_nonce1: Value = se.extra_nonce1.into();
        let extra_nonce2_size: Value = se.extra_nonce2_size.into();
        Message::Notification(Notification {
            method: "mining.set_extranonce".to_string(),
            parameters: (&[extra_nonce1, extra_nonce2_size][..]).into(),
        })
    }
}

impl TryFrom<Notification> for SetExtranonce {
    type Error = MethodError;

    fn try_from(msg: Notification) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let (extra_nonce1, extra_nonce2_size) = match &params[..] {
            [JString(a), JNumber(b)] => (
                a.as_str().try_into()?,
                b.as_u64()
                    .ok_or_else(|| ParsingMethodError::not_unsigned_from_value(b.clone()))?
                    as usize,
            ),
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        Ok(SetExtranonce {
            extra_nonce1,
            extra_nonce2_size,
        })
    }
}

/// _mining.set_version_mask(mask)_
///
/// The server may arbitrarily adjust the version rolling mask (BIP 310).
#[derive(Debug, Clone, PartialEq)]
pub struct SetVersionMask {
    pub version_mask: HexU32Be,
}

impl From<SetVersionMask> for Message {
    fn from(sv: SetVersionMask) -> Self {
        let version_mask: Value = sv.version_mask.into();
        Message::Notification(Notification {
            method: "mining.set_version_mask".to_string(),
            parameters: (&[version_mask][..]).into(),
        })
    }
}

impl TryFrom<Notification> for SetVersionMask {
    type Error = MethodError;

    fn try_from(msg: Notification) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let version_mask = match &params[..] {
            [JString(a)] => a.as_str().try_into()?,
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        Ok(SetVersionMask { version_mask })
    }
}

/// Typed view of a response to _mining.subscribe_.
///
/// The result contains three items: an array of 2-item subscription tuples,
/// the hex-encoded per-connection ExtraNonce1 and the ExtraNonce2 size.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeResult {
    pub id: u64,
    pub subscriptions: Vec<(String, String)>,
    pub extra_nonce1: HexBytes,
    pub extra_nonce2_size: usize,
}

impl From<SubscribeResult> for Message {
    fn from(su: SubscribeResult) -> Self {
        let subscriptions: Vec<Value> = su
            .subscriptions
            .iter()
            .map(|x| JArray(vec![JString(x.0.clone()), JString(x.1.clone())]))
            .collect();
        let extra_nonce1: Value = su.extra_nonce1.into();
        let extra_nonce2_size: Value = su.extra_nonce2_size.into();
        Message::Response(Response::ok(
            su.id,
            JArray(vec![JArray(subscriptions), extra_nonce1, extra_nonce2_size]),
        ))
    }
}

impl TryFrom<&Response> for SubscribeResult {
    type Error = MethodError;

    fn try_from(msg: &Response) -> Result<Self, Self::Error> {
        let params = msg
            .result
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.result.clone()))?;
        let (subscriptions_, extra_nonce1, extra_nonce2_size) = match &params[..] {
            [JArray(a), JString(b), JNumber(c)] => (
                a,
                b.as_str().try_into()?,
                c.as_u64()
                    .ok_or_else(|| ParsingMethodError::not_unsigned_from_value(c.clone()))?
                    as usize,
            ),
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.result.clone()).into()),
        };
        let mut subscriptions: Vec<(String, String)> = vec![];
        for s in subscriptions_ {
            // some pools send a flat 2 element array instead of a list of tuples
            let s = s
                .as_array()
                .ok_or_else(|| ParsingMethodError::unexpected_value_from_value(s.clone()))?;
            if s.len() != 2 {
                return Err(ParsingMethodError::wrong_args_from_value(msg.result.clone()).into());
            }
            let sub = (
                s[0].as_str().unwrap_or_default().to_string(),
                s[1].as_str().unwrap_or_default().to_string(),
            );
            subscriptions.push(sub);
        }
        Ok(SubscribeResult {
            id: msg.id,
            subscriptions,
            extra_nonce1,
            extra_nonce2_size,
        })
    }
}

/// Typed view of a response to _mining.configure_.
///
/// `{"id":1,"result":{"version-rolling":true,"version-rolling.mask":"18000000"},"error":null}`
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigureResult {
    pub id: u64,
    pub version_rolling: Option<bool>,
    pub version_rolling_mask: Option<HexU32Be>,
}

impl ConfigureResult {
    /// Negotiated mask, present only when the server accepted version rolling.
    pub fn negotiated_mask(&self) -> Option<HexU32Be> {
        if self.version_rolling == Some(true) {
            self.version_rolling_mask
        } else {
            None
        }
    }
}

impl From<ConfigureResult> for Message {
    fn from(co: ConfigureResult) -> Self {
        let mut params = serde_json::Map::new();
        if let Some(vr) = co.version_rolling {
            params.insert("version-rolling".to_string(), vr.into());
        }
        if let Some(mask) = co.version_rolling_mask {
            params.insert("version-rolling.mask".to_string(), mask.into());
        }
        Message::Response(Response::ok(co.id, Value::Object(params)))
    }
}

impl TryFrom<&Response> for ConfigureResult {
    type Error = MethodError;

    fn try_from(msg: &Response) -> Result<Self, Self::Error> {
        let params = msg
            .result
            .as_object()
            .ok_or_else(|| ParsingMethodError::unexpected_value_from_value(msg.result.clone()))?;
        let version_rolling = match params.get("version-rolling") {
            Some(v) => Some(
                v.as_bool()
                    .ok_or_else(|| ParsingMethodError::unexpected_value_from_value(v.clone()))?,
            ),
            None => None,
        };
        let version_rolling_mask = match params.get("version-rolling.mask") {
            Some(JString(m)) => Some(m.as_str().try_into()?),
            Some(v) => return Err(ParsingMethodError::unexpected_value_from_value(v.clone()).into()),
            None => None,
        };
        Ok(ConfigureResult {
            id: msg.id,
            version_rolling,
            version_rolling_mask,
        })
    }
}
