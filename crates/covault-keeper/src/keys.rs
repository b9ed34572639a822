//! Key lifecycle: observer enrollment, keygen batches, keygen intake
//!
//! Signer keys are born from MPC keygen sessions requested in batches;
//! observer keys are enrolled directly. Either way a key sits spare until
//! an account proposal binds it, and it only becomes eligible once its
//! backup has matured.

use crate::node::Node;
use crate::store::SpareKey;
use covault_core::operation::OPERATION_TYPE_KEYGEN_INPUT;
use covault_core::{
    fingerprint, unique_id, Operation, Payment, Request, RequestState, Result, Role,
    SIGNER_KEYGEN_MAXIMUM,
};
use tracing::info;

impl Node {
    /// `ObserverAddKey`: enroll an observer (or externally generated
    /// signer) key with its chain code
    pub(crate) fn add_observer_key(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: role flag, 32-byte chain code, reserved flag byte
        if req.extra.len() != 34 {
            return self.fail_request(req);
        }
        let Ok(flags) = Role::from_byte(req.extra[0]) else {
            return self.fail_request(req);
        };
        if flags == Role::Holder {
            return self.fail_request(req);
        }
        let chain_code: [u8; 32] = req.extra[1..33].try_into().expect("32 bytes");

        let Ok(public) = hex::decode(&req.holder) else {
            return self.fail_request(req);
        };
        if covault_core::chain::verify_holder_key(&req.holder, req.curve).is_err() {
            return self.fail_request(req);
        }

        let key = SpareKey {
            public: req.holder.clone(),
            fingerprint: hex::encode(fingerprint(&public)),
            curve: req.curve,
            chain_code,
            flags,
            holder: None,
            request_id: req.id.to_string(),
            created_at: req.created_at,
        };
        if !self.store.write_key_if_not_exists(&key)? {
            // an already known public key is a policy failure, not a crash
            return self.fail_request(req);
        }
        self.store.finish_request(&req.id, RequestState::Done)?;
        info!(request = %req.id, fingerprint = %key.fingerprint, role = %flags, "key enrolled");
        Ok(Vec::new())
    }

    /// `ObserverRequestSignerKeys`: start a batch of keygen sessions
    pub(crate) fn request_signer_keys(&self, req: &Request) -> Result<Vec<Payment>> {
        if req.extra.len() != 1 {
            return self.fail_request(req);
        }
        let batch = req.extra[0];
        if batch == 0 || batch > SIGNER_KEYGEN_MAXIMUM {
            return self.fail_request(req);
        }

        // session ids fold in the member set and threshold, so the same
        // batch redelivered dedups at the transport
        let members = format!(
            "MTG:{:?}:{}",
            self.conf.signer_members, self.conf.signer_threshold
        );
        let mut payments = Vec::with_capacity(batch as usize);
        for i in 0..batch {
            let sid = unique_id(&req.id.to_string(), &format!("{i:8}"));
            let sid = unique_id(&sid.to_string(), &members);
            let op = Operation {
                id: sid,
                op_type: OPERATION_TYPE_KEYGEN_INPUT,
                curve: req.curve as u8,
                public: Vec::new(),
                extra: Vec::new(),
            };
            payments.push(self.build_signer_payment(&op));
        }
        self.store.finish_request(&req.id, RequestState::Done)?;
        info!(request = %req.id, batch, "keygen batch dispatched");
        Ok(payments)
    }

    /// `KeygenOutput`: a completed keygen session delivers a spare signer key
    pub(crate) fn keygen_output(&self, req: &Request) -> Result<Vec<Payment>> {
        // extra: role flag, 32-byte chain code, reserved flag byte
        if req.extra.len() != 34 {
            return self.fail_request(req);
        }
        let Ok(flags) = Role::from_byte(req.extra[0]) else {
            return self.fail_request(req);
        };
        let chain_code: [u8; 32] = req.extra[1..33].try_into().expect("32 bytes");

        let Ok(public) = hex::decode(&req.holder) else {
            return self.fail_request(req);
        };
        if covault_core::chain::verify_holder_key(&req.holder, req.curve).is_err() {
            return self.fail_request(req);
        }

        let key = SpareKey {
            public: req.holder.clone(),
            fingerprint: hex::encode(fingerprint(&public)),
            curve: req.curve,
            chain_code,
            flags,
            holder: None,
            request_id: req.id.to_string(),
            created_at: req.created_at,
        };
        if !self.store.write_key_if_not_exists(&key)? {
            return self.fail_request(req);
        }
        self.store.finish_request(&req.id, RequestState::Done)?;
        info!(request = %req.id, fingerprint = %key.fingerprint, "keygen session finished");
        Ok(Vec::new())
    }
}
