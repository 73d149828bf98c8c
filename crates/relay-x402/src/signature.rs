//! EIP-712 signature verification for payment authorizations.
//!
//! The canonical authorization signs the EIP-3009
//! [`TransferWithAuthorization`](crate::TransferWithAuthorization) typed
//! struct under the asset's domain. Verification is delegated behind the
//! [`SignatureVerifier`] capability so schemes with other signature layouts
//! can be slotted in without touching the engine.

use std::borrow::Cow;

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::sol_types::{Eip712Domain, SolStruct};

use crate::config::{AssetConfig, NetworkConfig};
use crate::payment::Authorization;
use crate::TransferWithAuthorization;

/// Build the EIP-712 domain for an asset on a network. The token contract
/// is the verifying contract.
pub fn transfer_domain(network: &NetworkConfig, asset: &AssetConfig) -> Eip712Domain {
    Eip712Domain {
        name: Some(Cow::Owned(asset.eip712_name.clone())),
        version: Some(Cow::Owned(asset.eip712_version.clone())),
        chain_id: Some(U256::from(network.chain_id)),
        verifying_contract: Some(asset.address),
        salt: None,
    }
}

/// Compute the EIP-712 signing hash of an authorization under a domain.
pub fn signing_hash(auth: &Authorization, domain: &Eip712Domain) -> B256 {
    let typed = TransferWithAuthorization {
        from: auth.from,
        to: auth.to,
        value: auth.value,
        validAfter: U256::from(auth.valid_after),
        validBefore: U256::from(auth.valid_before),
        nonce: auth.nonce,
    };
    typed.eip712_signing_hash(domain)
}

/// secp256k1 curve order N / 2; signatures with s above this are malleable
/// (EIP-2) and rejected.
const SECP256K1_N_DIV_2: U256 = U256::from_limbs([
    0xBFD25E8CD0364140,
    0xBAAEDCE6AF48A03B,
    0xFFFFFFFFFFFFFFFE,
    0x7FFFFFFFFFFFFFFF,
]);

/// Signature verification capability.
///
/// Returns `true` only when the authorization carries a signature that
/// recovers to `auth.from` under the given domain. Never errors: anything
/// unparseable is simply not a valid signature.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, domain: &Eip712Domain, auth: &Authorization) -> bool;
}

/// EIP-712 recovery-based verifier with EIP-2 malleability protection.
pub struct Eip712Verifier;

impl SignatureVerifier for Eip712Verifier {
    fn verify(&self, domain: &Eip712Domain, auth: &Authorization) -> bool {
        let Some(parts) = auth.signature else {
            return false;
        };
        let Ok(sig) = Signature::from_raw(&parts.to_bytes()) else {
            return false;
        };
        if sig.s() > SECP256K1_N_DIV_2 {
            return false;
        }
        let hash = signing_hash(auth, domain);
        match sig.recover_address_from_prehash(&hash) {
            Ok(recovered) => recovered == auth.from,
            Err(_) => false,
        }
    }
}

/// Recover the signer address, if any. Diagnostic helper for logging.
pub fn recover_signer(domain: &Eip712Domain, auth: &Authorization) -> Option<Address> {
    let parts = auth.signature?;
    let sig = Signature::from_raw(&parts.to_bytes()).ok()?;
    let hash = signing_hash(auth, domain);
    sig.recover_address_from_prehash(&hash).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_networks;
    use crate::payment::SignatureParts;
    use alloy::primitives::{FixedBytes, U256};
    use alloy::signers::local::PrivateKeySigner;
    use alloy::signers::SignerSync;

    fn sample_auth(from: Address) -> Authorization {
        Authorization {
            from,
            to: Address::ZERO,
            value: U256::from(1000u64),
            valid_after: 0,
            valid_before: u64::MAX,
            nonce: FixedBytes::new([0x42; 32]),
            signature: None,
        }
    }

    fn test_domain() -> Eip712Domain {
        let networks = default_networks();
        let network = &networks["base-sepolia"];
        transfer_domain(network, &network.assets[0])
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signer = PrivateKeySigner::random();
        let domain = test_domain();
        let mut auth = sample_auth(signer.address());

        let hash = signing_hash(&auth, &domain);
        let sig = signer.sign_hash_sync(&hash).unwrap();
        auth.signature = Some(SignatureParts::from_compact(&sig.as_bytes()).unwrap());

        assert!(Eip712Verifier.verify(&domain, &auth));
        assert_eq!(recover_signer(&domain, &auth), Some(signer.address()));
    }

    #[test]
    fn tampered_value_fails_verification() {
        let signer = PrivateKeySigner::random();
        let domain = test_domain();
        let mut auth = sample_auth(signer.address());

        let hash = signing_hash(&auth, &domain);
        let sig = signer.sign_hash_sync(&hash).unwrap();
        auth.signature = Some(SignatureParts::from_compact(&sig.as_bytes()).unwrap());
        auth.value = U256::from(9999u64);

        assert!(!Eip712Verifier.verify(&domain, &auth));
    }

    #[test]
    fn wrong_signer_fails_verification() {
        let signer = PrivateKeySigner::random();
        let other = PrivateKeySigner::random();
        let domain = test_domain();
        let mut auth = sample_auth(other.address());

        let hash = signing_hash(&auth, &domain);
        let sig = signer.sign_hash_sync(&hash).unwrap();
        auth.signature = Some(SignatureParts::from_compact(&sig.as_bytes()).unwrap());

        assert!(!Eip712Verifier.verify(&domain, &auth));
    }

    #[test]
    fn missing_signature_is_invalid() {
        let domain = test_domain();
        let auth = sample_auth(Address::ZERO);
        assert!(!Eip712Verifier.verify(&domain, &auth));
    }
}
