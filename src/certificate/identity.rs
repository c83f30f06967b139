use crate::utils::only_digits;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::oid_registry;
use zeroize::Zeroizing;

/// ICP-Brasil SAN otherName carrying the corporate tax id (CNPJ)
const OID_CNPJ: &str = "2.16.76.1.3.3";
/// ICP-Brasil SAN otherName carrying the holder's personal data (birth date + CPF + ...)
const OID_PERSON: &str = "2.16.76.1.3.1";

#[derive(Debug, Error)]
pub enum CertificateError {
	#[error("Invalid identity bundle: {0}")]
	InvalidBundle(String),

	#[error("Certificate parse error: {0}")]
	Parse(String),
}

/// Kind of tax identifier bound to a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaxIdKind {
	/// Corporate (CNPJ, 14 digits)
	Cnpj,
	/// Individual (CPF, 11 digits)
	Cpf,
}

impl TaxIdKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			TaxIdKind::Cnpj => "CNPJ",
			TaxIdKind::Cpf => "CPF",
		}
	}
}

/// Tax identifier extracted from a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxIdentity {
	pub kind: TaxIdKind,
	pub digits: String,
}

impl TaxIdentity {
	/// The 8-digit corporate root of a CNPJ.
	pub fn corporate_root(&self) -> Option<&str> {
		match self.kind {
			TaxIdKind::Cnpj => self.digits.get(..8),
			TaxIdKind::Cpf => None,
		}
	}
}

/// Decrypted certificate chain and private key.
///
/// Both PEM strings are wiped from memory when the value is dropped, on every exit path. The
/// material is never cached: build one per cycle or per call.
pub struct IdentityMaterial {
	cert_chain_pem: Zeroizing<String>,
	private_key_pem: Zeroizing<String>,
	fingerprint: String,
}

impl IdentityMaterial {
	/// Wrap already decoded PEM material (leaf certificate first).
	pub fn from_pem(
		cert_chain_pem: String,
		private_key_pem: String,
	) -> Result<Self, CertificateError> {
		let cert_chain_pem = Zeroizing::new(cert_chain_pem);
		let private_key_pem = Zeroizing::new(private_key_pem);

		let leaf = leaf_der_of(&cert_chain_pem)?;
		let fingerprint = hex::encode(Sha256::digest(&leaf));

		Ok(Self {
			cert_chain_pem,
			private_key_pem,
			fingerprint,
		})
	}

	pub fn cert_chain_pem(&self) -> &str {
		&self.cert_chain_pem
	}

	/// PKCS#8 private key in PEM form
	pub fn private_key_pem(&self) -> &str {
		&self.private_key_pem
	}

	/// SHA-256 fingerprint (hex) of the leaf certificate, safe to log
	pub fn fingerprint(&self) -> &str {
		&self.fingerprint
	}

	/// DER bytes of the leaf certificate.
	pub fn leaf_der(&self) -> Result<Vec<u8>, CertificateError> {
		leaf_der_of(&self.cert_chain_pem)
	}
}

impl fmt::Debug for IdentityMaterial {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IdentityMaterial")
			.field("fingerprint", &self.fingerprint)
			.field("private_key_pem", &"<redacted>")
			.finish()
	}
}

fn leaf_der_of(chain_pem: &str) -> Result<Vec<u8>, CertificateError> {
	let blocks = pem::parse_many(chain_pem)
		.map_err(|e| CertificateError::Parse(format!("Invalid PEM chain: {e}")))?;
	blocks
		.into_iter()
		.find(|block| block.tag() == "CERTIFICATE")
		.map(|block| block.into_contents())
		.ok_or_else(|| CertificateError::Parse("PEM chain holds no certificate".into()))
}

/// Decode a PKCS#12 bundle into PEM certificate chain and PKCS#8 private key.
///
/// # Arguments
/// * `bundle` - The encrypted PKCS#12 container bytes.
/// * `passphrase` - The container passphrase.
///
/// # Returns
/// The decrypted `IdentityMaterial`, or `InvalidBundle` when the passphrase is wrong or the
/// container holds no key/certificate pair.
pub fn resolve(bundle: &[u8], passphrase: &str) -> Result<IdentityMaterial, CertificateError> {
	let parsed = parse_bundle(bundle, passphrase)?;

	let pkey = parsed
		.pkey
		.ok_or_else(|| CertificateError::InvalidBundle("bundle contains no private key".into()))?;
	let cert = parsed
		.cert
		.ok_or_else(|| CertificateError::InvalidBundle("bundle contains no certificate".into()))?;

	let mut chain = String::from_utf8(cert.to_pem().map_err(parse_error)?)
		.map_err(|e| CertificateError::Parse(e.to_string()))?;
	if let Some(ca_certs) = parsed.ca {
		for ca in ca_certs {
			let pem = ca.to_pem().map_err(parse_error)?;
			chain.push_str(&String::from_utf8_lossy(&pem));
		}
	}

	let key_pem = Zeroizing::new(pkey.private_key_to_pem_pkcs8().map_err(parse_error)?);
	let key_pem = String::from_utf8(key_pem.to_vec())
		.map_err(|e| CertificateError::Parse(e.to_string()))?;

	IdentityMaterial::from_pem(chain, key_pem)
}

/// Inspect the leaf certificate of a bundle for the bound tax identifier.
///
/// Looks at the ICP-Brasil subject alternative name identifiers first, then at the subject
/// `serialNumber` attribute. Returns `Ok(None)` when neither yields a plausible identifier.
pub fn extract_identity(
	bundle: &[u8],
	passphrase: &str,
) -> Result<Option<TaxIdentity>, CertificateError> {
	let parsed = parse_bundle(bundle, passphrase)?;
	let cert = parsed
		.cert
		.ok_or_else(|| CertificateError::InvalidBundle("bundle contains no certificate".into()))?;
	let der = cert.to_der().map_err(parse_error)?;

	identity_from_der(&der)
}

/// Tax identifier lookup on a DER-encoded certificate.
pub fn identity_from_der(der: &[u8]) -> Result<Option<TaxIdentity>, CertificateError> {
	let (_, x509) = x509_parser::parse_x509_certificate(der)
		.map_err(|e| CertificateError::Parse(format!("Failed to parse X.509: {e}")))?;

	if let Ok(Some(san)) = x509.subject_alternative_name() {
		for name in &san.value.general_names {
			let GeneralName::OtherName(oid, value) = name else {
				continue;
			};
			let digits = only_digits(&String::from_utf8_lossy(other_name_content(value)));
			let oid = oid.to_id_string();

			if oid == OID_CNPJ && digits.len() >= 14 {
				let cnpj = &digits[digits.len() - 14..];
				if plausible(cnpj) {
					return Ok(Some(TaxIdentity {
						kind: TaxIdKind::Cnpj,
						digits: cnpj.to_string(),
					}));
				}
			} else if oid == OID_PERSON && digits.len() >= 11 {
				// birth date (8) followed by the CPF (11)
				let cpf = if digits.len() >= 19 {
					&digits[8..19]
				} else {
					&digits[digits.len() - 11..]
				};
				if plausible(cpf) {
					return Ok(Some(TaxIdentity {
						kind: TaxIdKind::Cpf,
						digits: cpf.to_string(),
					}));
				}
			}
		}
	}

	for rdn in x509.subject().iter_rdn() {
		for attr in rdn.iter() {
			if attr.attr_type() != &oid_registry::OID_X509_SERIALNUMBER {
				continue;
			}
			let digits = only_digits(attr.as_str().unwrap_or_default());
			if digits.len() >= 14 && plausible(&digits[..14]) {
				return Ok(Some(TaxIdentity {
					kind: TaxIdKind::Cnpj,
					digits: digits[..14].to_string(),
				}));
			}
			if digits.len() >= 11 && plausible(&digits[..11]) {
				return Ok(Some(TaxIdentity {
					kind: TaxIdKind::Cpf,
					digits: digits[..11].to_string(),
				}));
			}
		}
	}

	Ok(None)
}

fn parse_bundle(
	bundle: &[u8],
	passphrase: &str,
) -> Result<openssl::pkcs12::ParsedPkcs12_2, CertificateError> {
	let pkcs12 = openssl::pkcs12::Pkcs12::from_der(bundle)
		.map_err(|e| CertificateError::InvalidBundle(format!("not a PKCS#12 container: {e}")))?;
	pkcs12
		.parse2(passphrase)
		.map_err(|e| CertificateError::InvalidBundle(format!("wrong passphrase or corrupted: {e}")))
}

fn parse_error(e: openssl::error::ErrorStack) -> CertificateError {
	CertificateError::Parse(e.to_string())
}

fn plausible(digits: &str) -> bool {
	digits.chars().any(|c| c != '0')
}

/// Unwrap the `[0] EXPLICIT` tag and the inner string type of an otherName value.
fn other_name_content(value: &[u8]) -> &[u8] {
	let mut content = value;
	// context-specific constructed [0]
	if content.first() == Some(&0xA0) {
		content = strip_tlv_header(content);
	}
	// OCTET STRING, UTF8String, PrintableString, IA5String
	if matches!(content.first(), Some(0x04 | 0x0C | 0x13 | 0x16)) {
		content = strip_tlv_header(content);
	}
	content
}

fn strip_tlv_header(tlv: &[u8]) -> &[u8] {
	let Some(&len) = tlv.get(1) else {
		return &[];
	};
	let header = if len & 0x80 == 0 {
		2
	} else {
		2 + usize::from(len & 0x7F)
	};
	tlv.get(header..).unwrap_or_default()
}
