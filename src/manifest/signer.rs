//! Enveloped XML-DSig for manifestation events.
//!
//! The event is rendered directly in canonical (C14N 1.0 inclusive) form, so the digest is taken over
//! the `infEvento` text as written, with the default namespace it inherits from `envEvento` declared
//! on it. `SignedInfo` is canonicalized the same way under the signature namespace and signed with
//! RSA-SHA256. The `Signature` element lands inside `evento`, right after `infEvento`.

use crate::certificate::IdentityMaterial;
use crate::manifest::{ManifestError, ManifestationEvent};
use crate::manifest::event::EVENT_VERSION;
use crate::ws::soap::{NS_DSIG, escape_attr};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::RsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use sha2::{Digest, Sha256};
use std::fmt;

const ALG_C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
const ALG_ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const ALG_RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
const ALG_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";

/// Signs events with the company's certificate key.
pub struct EventSigner {
	signing_key: SigningKey<Sha256>,
	certificate: String,
}

impl fmt::Debug for EventSigner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("EventSigner").finish_non_exhaustive()
	}
}

impl EventSigner {
	/// Build a signer from resolved identity material.
	///
	/// # Errors
	/// `Signing` when the private key is not an RSA PKCS#8 key, `Certificate` when the chain holds no
	/// leaf certificate.
	pub fn from_identity(identity: &IdentityMaterial) -> Result<Self, ManifestError> {
		let private_key = RsaPrivateKey::from_pkcs8_pem(identity.private_key_pem())
			.map_err(|e| ManifestError::Signing(format!("unsupported private key: {e}")))?;
		let certificate = STANDARD.encode(identity.leaf_der()?);

		Ok(Self {
			signing_key: SigningKey::<Sha256>::new(private_key),
			certificate,
		})
	}

	/// Render `event` as a signed `<evento>` element.
	pub fn sign(&self, event: &ManifestationEvent) -> Result<String, ManifestError> {
		let reference = format!("#{}", event.id());

		let digest = Sha256::digest(event.inf_evento(true).as_bytes());
		let digest_value = STANDARD.encode(digest);

		let canonical_signed_info = signed_info(&reference, &digest_value, true);
		let signature = self
			.signing_key
			.try_sign(canonical_signed_info.as_bytes())
			.map_err(|e| ManifestError::Signing(e.to_string()))?;
		let signature_value = STANDARD.encode(signature.to_bytes());

		Ok(format!(
			concat!(
				r#"<evento versao="{ver}">{inf}"#,
				r#"<Signature xmlns="{dsig}">{signed_info}"#,
				"<SignatureValue>{sig}</SignatureValue>",
				"<KeyInfo><X509Data><X509Certificate>{cert}</X509Certificate></X509Data></KeyInfo>",
				"</Signature></evento>",
			),
			ver = EVENT_VERSION,
			inf = event.inf_evento(false),
			dsig = NS_DSIG,
			signed_info = signed_info(&reference, &digest_value, false),
			sig = signature_value,
			cert = self.certificate,
		))
	}
}

/// `SignedInfo` in canonical form; `declare_ns` for the standalone (signed) rendition.
pub(crate) fn signed_info(reference: &str, digest_value: &str, declare_ns: bool) -> String {
	let ns = if declare_ns {
		format!(r#" xmlns="{NS_DSIG}""#)
	} else {
		String::new()
	};
	format!(
		concat!(
			"<SignedInfo{ns}>",
			r#"<CanonicalizationMethod Algorithm="{c14n}"></CanonicalizationMethod>"#,
			r#"<SignatureMethod Algorithm="{rsa}"></SignatureMethod>"#,
			r#"<Reference URI="{uri}"><Transforms>"#,
			r#"<Transform Algorithm="{env}"></Transform>"#,
			r#"<Transform Algorithm="{c14n}"></Transform>"#,
			"</Transforms>",
			r#"<DigestMethod Algorithm="{sha}"></DigestMethod>"#,
			"<DigestValue>{digest}</DigestValue>",
			"</Reference></SignedInfo>",
		),
		ns = ns,
		c14n = ALG_C14N,
		rsa = ALG_RSA_SHA256,
		uri = escape_attr(reference),
		env = ALG_ENVELOPED,
		sha = ALG_SHA256,
		digest = digest_value,
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::certificate::{resolve, test_bundle};
	use crate::config::Environment;
	use crate::manifest::EventType;
	use crate::manifest::event::batch_envelope;
	use crate::ws::DocumentKey;
	use crate::ws::soap::NS_NFE;
	use openssl::hash::MessageDigest;
	use openssl::sign::Verifier;
	use openssl::x509::X509;

	const KEY: &str = "35240112345678000195550010000000011000000010";

	fn event() -> ManifestationEvent {
		ManifestationEvent::new(
			Environment::Staging,
			"12345678000195",
			DocumentKey::parse(KEY).unwrap(),
			EventType::Confirmation,
			1,
			"91",
		)
	}

	fn text(doc: &roxmltree::Document<'_>, local: &str) -> String {
		doc.descendants()
			.find(|n| n.tag_name().name() == local)
			.and_then(|n| n.text())
			.unwrap()
			.to_string()
	}

	#[test]
	fn signature_verifies_against_the_certificate() {
		let identity = resolve(&test_bundle("pw", None, None), "pw").unwrap();
		let signer = EventSigner::from_identity(&identity).unwrap();
		let event = event();

		let signed = signer.sign(&event).unwrap();
		let batch = batch_envelope(1_700_000_000, &signed);
		let doc = roxmltree::Document::parse(&batch).unwrap();

		// Signature sits inside evento, after infEvento
		let evento = doc
			.descendants()
			.find(|n| n.has_tag_name((NS_NFE, "evento")))
			.unwrap();
		let children: Vec<&str> = evento
			.children()
			.filter(|n| n.is_element())
			.map(|n| n.tag_name().name())
			.collect();
		assert_eq!(children, vec!["infEvento", "Signature"]);
		let signature = evento.last_element_child().unwrap();
		assert_eq!(signature.tag_name().namespace(), Some(NS_DSIG));

		let digest_value = text(&doc, "DigestValue");
		let expected = STANDARD.encode(Sha256::digest(event.inf_evento(true).as_bytes()));
		assert_eq!(digest_value, expected);

		let cert_der = STANDARD.decode(text(&doc, "X509Certificate")).unwrap();
		assert_eq!(cert_der, identity.leaf_der().unwrap());
		let public_key = X509::from_der(&cert_der).unwrap().public_key().unwrap();

		let canonical = signed_info(&format!("#{}", event.id()), &digest_value, true);
		let signature = STANDARD.decode(text(&doc, "SignatureValue")).unwrap();
		let mut verifier = Verifier::new(MessageDigest::sha256(), &public_key).unwrap();
		verifier.update(canonical.as_bytes()).unwrap();
		assert!(verifier.verify(&signature).unwrap());
	}

	#[test]
	fn tampered_event_breaks_the_digest() {
		let identity = resolve(&test_bundle("pw", None, None), "pw").unwrap();
		let signer = EventSigner::from_identity(&identity).unwrap();
		let signed = signer.sign(&event()).unwrap();

		let mut other = event();
		other.sequence = 2;
		let digest = STANDARD.encode(Sha256::digest(other.inf_evento(true).as_bytes()));
		assert!(!signed.contains(&digest));
	}

	#[test]
	fn debug_does_not_leak_the_key() {
		let identity = resolve(&test_bundle("pw", None, None), "pw").unwrap();
		let signer = EventSigner::from_identity(&identity).unwrap();
		assert_eq!(format!("{signer:?}"), "EventSigner { .. }");
	}
}
