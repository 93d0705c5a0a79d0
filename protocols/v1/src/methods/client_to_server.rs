use serde_json::{
    Value,
    Value::{Array as JArray, Object as JObject, String as JString},
};
use std::convert::{TryFrom, TryInto};

use crate::{
    json_rpc::{Message, Response, StandardRequest},
    methods::{MethodError, ParsingMethodError},
    utils::{HexBytes, HexU32Be},
};

#[cfg(test)]
use quickcheck::{Arbitrary, Gen};

/// _mining.authorize("username", "password")_
///
/// The result from an authorize request is usually true (successful), or false.
/// The password may be omitted if the server does not require passwords.
#[derive(Debug, Clone, PartialEq)]
pub struct Authorize {
    pub id: u64,
    pub name: String,
    pub password: String,
}

impl Authorize {
    pub fn respond(&self, is_ok: bool) -> Response {
        Response::ok(self.id, Value::Bool(is_ok))
    }
}

impl From<Authorize> for Message {
    fn from(auth: Authorize) -> Self {
        Message::StandardRequest(StandardRequest {
            id: auth.id,
            method: "mining.authorize".into(),
            parameters: (&[auth.name, auth.password][..]).into(),
        })
    }
}

impl TryFrom<StandardRequest> for Authorize {
    type Error = MethodError;

    fn try_from(msg: StandardRequest) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let (name, password) = match &params[..] {
            [JString(a), JString(b)] => (a.into(), b.into()),
            // password-less miners exist in the wild
            [JString(a)] => (a.into(), "".to_string()),
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        Ok(Self {
            id: msg.id,
            name,
            password,
        })
    }
}

/// _mining.extranonce.subscribe()_
///
/// Indicates to the server that the client supports mining.set_extranonce.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtranonceSubscribe {
    pub id: u64,
}

impl From<ExtranonceSubscribe> for Message {
    fn from(e: ExtranonceSubscribe) -> Self {
        Message::StandardRequest(StandardRequest {
            id: e.id,
            method: "mining.extranonce.subscribe".into(),
            parameters: JArray(vec![]),
        })
    }
}

/// _mining.submit("username", "job id", "ExtraNonce2", "nTime", "nOnce", "version_bits"?)_
///
/// The hex fields are kept as their exact wire width (extranonce2 raw bytes,
/// ntime/nonce/version_bits 4 byte words) because share deduplication
/// fingerprints are computed over them bit for bit.
#[derive(Debug, Clone, PartialEq)]
pub struct Submit {
    pub id: u64,
    pub user_name: String,
    pub job_id: String,
    pub extra_nonce2: HexBytes,
    pub time: HexU32Be,
    pub nonce: HexU32Be,
    pub version_bits: Option<HexU32Be>,
}

impl Submit {
    pub fn respond(&self, is_ok: bool) -> Response {
        Response::ok(self.id, Value::Bool(is_ok))
    }
}

impl From<Submit> for Message {
    fn from(submit: Submit) -> Self {
        let mut parameters: Vec<Value> = vec![
            submit.user_name.into(),
            submit.job_id.into(),
            submit.extra_nonce2.into(),
            submit.time.into(),
            submit.nonce.into(),
        ];
        if let Some(a) = submit.version_bits {
            parameters.push(a.into());
        };
        Message::StandardRequest(StandardRequest {
            id: submit.id,
            method: "mining.submit".into(),
            parameters: parameters.into(),
        })
    }
}

impl TryFrom<StandardRequest> for Submit {
    type Error = MethodError;

    fn try_from(msg: StandardRequest) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let (user_name, job_id, extra_nonce2, time, nonce, version_bits) = match &params[..] {
            [JString(a), JString(b), JString(c), JString(d), JString(e)] => (
                a.into(),
                b.into(),
                c.as_str().try_into()?,
                d.as_str().try_into()?,
                e.as_str().try_into()?,
                None,
            ),
            [JString(a), JString(b), JString(c), JString(d), JString(e), JString(f)] => (
                a.into(),
                b.into(),
                c.as_str().try_into()?,
                d.as_str().try_into()?,
                e.as_str().try_into()?,
                Some(f.as_str().try_into()?),
            ),
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        Ok(Submit {
            id: msg.id,
            user_name,
            job_id,
            extra_nonce2,
            time,
            nonce,
            version_bits,
        })
    }
}

/// _mining.subscribe("user agent/version", "extranonce1")_
///
/// The optional second parameter is a subscription id the client wishes to
/// resume working with after a dropped connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub id: u64,
    pub agent_signature: String,
    pub extranonce1: Option<HexBytes>,
}

impl From<Subscribe> for Message {
    fn from(subscribe: Subscribe) -> Self {
        let mut parameters: Vec<Value> = vec![subscribe.agent_signature.into()];
        if let Some(a) = subscribe.extranonce1 {
            parameters.push(a.into());
        };
        Message::StandardRequest(StandardRequest {
            id: subscribe.id,
            method: "mining.subscribe".into(),
            parameters: parameters.into(),
        })
    }
}

impl TryFrom<StandardRequest> for Subscribe {
    type Error = MethodError;

    fn try_from(msg: StandardRequest) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let (agent_signature, extranonce1) = match &params[..] {
            [JString(a), JString(b)] => (a.into(), Some(b.as_str().try_into()?)),
            [JString(a)] => (a.into(), None),
            [] => ("".to_string(), None),
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };
        Ok(Subscribe {
            id: msg.id,
            agent_signature,
            extranonce1,
        })
    }
}

/// _mining.configure(extensions, extension-parameters)_
///
/// Negotiates protocol extensions before subscription; the proxy only cares
/// about version-rolling (BIP 310).
///
/// `{"method": "mining.configure", "id": 1, "params": [["version-rolling"],
/// {"version-rolling.mask": "1fffe000", "version-rolling.min-bit-count": 2}]}`
#[derive(Debug, Clone, PartialEq)]
pub struct Configure {
    pub id: u64,
    pub version_rolling: Option<VersionRollingParams>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionRollingParams {
    pub mask: HexU32Be,
    pub min_bit_count: u64,
}

impl Configure {
    pub fn new(id: u64, mask: HexU32Be, min_bit_count: u64) -> Self {
        Configure {
            id,
            version_rolling: Some(VersionRollingParams {
                mask,
                min_bit_count,
            }),
        }
    }

    pub fn version_rolling_mask(&self) -> Option<HexU32Be> {
        self.version_rolling.as_ref().map(|p| p.mask)
    }

    pub fn version_rolling_min_bit_count(&self) -> Option<u64> {
        self.version_rolling.as_ref().map(|p| p.min_bit_count)
    }
}

impl From<Configure> for Message {
    fn from(conf: Configure) -> Self {
        let mut extensions: Vec<Value> = vec![];
        let mut extension_params = serde_json::Map::new();
        if let Some(vr) = conf.version_rolling {
            extensions.push("version-rolling".into());
            extension_params.insert("version-rolling.mask".to_string(), vr.mask.into());
            extension_params.insert(
                "version-rolling.min-bit-count".to_string(),
                vr.min_bit_count.into(),
            );
        }
        Message::StandardRequest(StandardRequest {
            id: conf.id,
            method: "mining.configure".into(),
            parameters: JArray(vec![JArray(extensions), JObject(extension_params)]),
        })
    }
}

impl TryFrom<StandardRequest> for Configure {
    type Error = MethodError;

    fn try_from(msg: StandardRequest) -> Result<Self, Self::Error> {
        let params = msg
            .parameters
            .as_array()
            .ok_or_else(|| ParsingMethodError::not_array_from_value(msg.parameters.clone()))?;
        let empty = serde_json::Map::new();
        let (extensions, extension_params) = match &params[..] {
            [JArray(a), JObject(b)] => (a, b),
            [JArray(a)] => (a, &empty),
            _ => return Err(ParsingMethodError::wrong_args_from_value(msg.parameters).into()),
        };

        let wants_version_rolling = extensions
            .iter()
            .any(|e| e.as_str() == Some("version-rolling"));

        let version_rolling = if wants_version_rolling {
            let mask = match extension_params.get("version-rolling.mask") {
                Some(JString(m)) => m.as_str().try_into()?,
                // BIP 310 default when the miner does not name a mask
                _ => HexU32Be(0xffffffff),
            };
            let min_bit_count = extension_params
                .get("version-rolling.min-bit-count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            Some(VersionRollingParams {
                mask,
                min_bit_count,
            })
        } else {
            None
        };

        Ok(Configure {
            id: msg.id,
            version_rolling,
        })
    }
}

#[cfg(test)]
impl Arbitrary for Submit {
    fn arbitrary(g: &mut Gen) -> Self {
        let xn2: Vec<u8> = (0..8).map(|_| u8::arbitrary(g)).collect();
        Submit {
            id: u64::arbitrary(g),
            user_name: String::arbitrary(g),
            job_id: String::arbitrary(g),
            extra_nonce2: xn2.into(),
            time: HexU32Be(u32::arbitrary(g)),
            nonce: HexU32Be(u32::arbitrary(g)),
            version_bits: Option::<u32>::arbitrary(g).map(HexU32Be),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[quickcheck_macros::quickcheck]
    fn submit_roundtrips(submit: Submit) -> bool {
        let message = Into::<Message>::into(submit.clone());
        let request = match message {
            Message::StandardRequest(s) => s,
            _ => panic!(),
        };
        submit == TryInto::<Submit>::try_into(request).unwrap()
    }

    #[test]
    fn configure_parses_version_rolling() {
        let line = r#"{"method":"mining.configure","id":1,"params":[["version-rolling"],{"version-rolling.mask":"1fffe000","version-rolling.min-bit-count":2}]}"#;
        let msg: Message = serde_json::from_str(line).unwrap();
        let req = match msg {
            Message::StandardRequest(r) => r,
            _ => panic!(),
        };
        let conf: Configure = req.try_into().unwrap();
        assert_eq!(conf.version_rolling_mask(), Some(HexU32Be(0x1fffe000)));
        assert_eq!(conf.version_rolling_min_bit_count(), Some(2));
    }

    #[test]
    fn authorize_without_password() {
        let req = StandardRequest {
            id: 3,
            method: "mining.authorize".into(),
            parameters: serde_json::json!(["acct.w1"]),
        };
        let auth: Authorize = req.try_into().unwrap();
        assert_eq!(auth.name, "acct.w1");
        assert_eq!(auth.password, "");
    }
}
