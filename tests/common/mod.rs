#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dfe_sync::certificate::{self, IdentityMaterial};
use dfe_sync::service::Connector;
use dfe_sync::ws::{ExchangeError, HttpExchange, HttpReply, ProtocolError};
use flate2::Compression;
use flate2::write::GzEncoder;
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::x509::{X509, X509NameBuilder};
use std::io::Write;
use std::sync::{Arc, Mutex};

pub const TAX_ID: &str = "12345678000195";

/// Self-signed PKCS#12 bundle (passphrase `pw`) without an embedded tax id.
pub fn bundle() -> Vec<u8> {
	let pkey = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
	let mut name = X509NameBuilder::new().unwrap();
	name.append_entry_by_nid(Nid::COMMONNAME, "EMPRESA TESTE LTDA")
		.unwrap();
	let name = name.build();

	let mut builder = X509::builder().unwrap();
	builder.set_version(2).unwrap();
	builder.set_subject_name(&name).unwrap();
	builder.set_issuer_name(&name).unwrap();
	builder.set_pubkey(&pkey).unwrap();
	builder
		.set_not_before(&Asn1Time::days_from_now(0).unwrap())
		.unwrap();
	builder
		.set_not_after(&Asn1Time::days_from_now(30).unwrap())
		.unwrap();
	builder.sign(&pkey, MessageDigest::sha256()).unwrap();
	let cert = builder.build();

	Pkcs12::builder()
		.name("test")
		.pkey(&pkey)
		.cert(&cert)
		.build2("pw")
		.unwrap()
		.to_der()
		.unwrap()
}

pub fn identity() -> IdentityMaterial {
	certificate::resolve(&bundle(), "pw").unwrap()
}

type Handler = Box<dyn Fn(&str, &str) -> Result<HttpReply, ExchangeError> + Send + Sync>;

/// HTTP double answering every POST through a handler of (url, body).
pub struct RoutedHttp {
	handler: Handler,
	pub requests: Mutex<Vec<(String, String)>>,
}

impl RoutedHttp {
	pub fn new(
		handler: impl Fn(&str, &str) -> Result<HttpReply, ExchangeError> + Send + Sync + 'static,
	) -> Arc<Self> {
		Arc::new(Self {
			handler: Box::new(handler),
			requests: Mutex::new(Vec::new()),
		})
	}

	pub fn bodies(&self) -> Vec<String> {
		self.requests
			.lock()
			.unwrap()
			.iter()
			.map(|(_, b)| b.clone())
			.collect()
	}

	pub fn urls(&self) -> Vec<String> {
		self.requests
			.lock()
			.unwrap()
			.iter()
			.map(|(u, _)| u.clone())
			.collect()
	}
}

#[async_trait]
impl HttpExchange for RoutedHttp {
	async fn post(
		&self,
		url: &str,
		_headers: &[(&'static str, String)],
		body: String,
	) -> Result<HttpReply, ExchangeError> {
		let reply = (self.handler)(url, &body);
		self.requests.lock().unwrap().push((url.to_string(), body));
		reply
	}

	async fn get(&self, _url: &str) -> Result<HttpReply, ExchangeError> {
		Ok(HttpReply {
			status: 404,
			body: String::new(),
		})
	}
}

/// Connector handing out the same double for every identity.
pub struct FixedConnector(pub Arc<RoutedHttp>);

impl Connector for FixedConnector {
	fn connect(&self, _: &IdentityMaterial) -> Result<Arc<dyn HttpExchange>, ProtocolError> {
		Ok(self.0.clone())
	}
}

pub fn http_ok(body: String) -> Result<HttpReply, ExchangeError> {
	Ok(HttpReply { status: 200, body })
}

pub fn http_status(status: u16) -> Result<HttpReply, ExchangeError> {
	Ok(HttpReply {
		status,
		body: String::new(),
	})
}

pub fn summary_xml(nsu: u64) -> String {
	format!(
		"<resNFe xmlns=\"http://www.portalfiscal.inf.br/nfe\" versao=\"1.01\"><chNFe>352401123456780001955500100000{nsu:04}1000000010</chNFe><xNome>FORNECEDOR</xNome></resNFe>"
	)
}

fn doc_zip(nsu: u64, xml: &str) -> String {
	let mut enc = GzEncoder::new(Vec::new(), Compression::default());
	enc.write_all(xml.as_bytes()).unwrap();
	format!(
		r#"<docZip NSU="{nsu:015}" schema="resNFe_v1.01.xsd">{}</docZip>"#,
		STANDARD.encode(enc.finish().unwrap())
	)
}

/// SOAP 1.2 distribution answer carrying summary documents for `nsus`.
pub fn dist_answer(status: u16, ult: u64, max: u64, nsus: &[u64]) -> String {
	let docs: String = nsus.iter().map(|n| doc_zip(*n, &summary_xml(*n))).collect();
	let lote = if docs.is_empty() {
		String::new()
	} else {
		format!("<loteDistDFeInt>{docs}</loteDistDFeInt>")
	};
	format!(
		concat!(
			r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"><soap:Body>"#,
			r#"<nfeDistDFeInteresseResponse xmlns="http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe">"#,
			"<nfeDistDFeInteresseResult>",
			r#"<retDistDFeInt xmlns="http://www.portalfiscal.inf.br/nfe" versao="1.01">"#,
			"<tpAmb>2</tpAmb><verAplic>1.0</verAplic><cStat>{status}</cStat><xMotivo>motivo {status}</xMotivo>",
			"<dhResp>2024-01-15T10:30:00-03:00</dhResp><ultNSU>{ult:015}</ultNSU><maxNSU>{max:015}</maxNSU>",
			"{lote}</retDistDFeInt></nfeDistDFeInteresseResult></nfeDistDFeInteresseResponse>",
			"</soap:Body></soap:Envelope>",
		),
		status = status,
		ult = ult,
		max = max,
		lote = lote,
	)
}

/// The `<NSU>` of a targeted pull request body, if it is one.
pub fn targeted_nsu(body: &str) -> Option<u64> {
	let start = body.find("<NSU>")? + "<NSU>".len();
	let end = body[start..].find("</NSU>")? + start;
	body[start..end].parse().ok()
}
