//! SOAP 1.1/1.2 envelope construction and result unwrapping.

use crate::ws::types::ProtocolError;
use serde::Serialize;
use std::fmt;

/// Portal fiscal schema namespace of every payload element
pub const NS_NFE: &str = "http://www.portalfiscal.inf.br/nfe";
/// Distribution service namespace
pub const NS_DIST_WS: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe";
/// Event reception (v4) service namespace
pub const NS_EVENT_WS: &str = "http://www.portalfiscal.inf.br/nfe/wsdl/NFeRecepcaoEvento4";
pub const NS_DSIG: &str = "http://www.w3.org/2000/09/xmldsig#";

pub const NS_SOAP11: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const NS_SOAP12: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Distribution operation name
pub const OP_DISTRIBUTION: &str = "nfeDistDFeInteresse";

const ACCEPT: &str = "application/soap+xml, text/xml;q=0.9, */*;q=0.8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SoapVersion {
	#[serde(rename = "1.1")]
	V11,
	#[serde(rename = "1.2")]
	V12,
}

impl SoapVersion {
	fn envelope_ns(&self) -> &'static str {
		match self {
			SoapVersion::V11 => NS_SOAP11,
			SoapVersion::V12 => NS_SOAP12,
		}
	}
}

impl fmt::Display for SoapVersion {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SoapVersion::V11 => f.write_str("1.1"),
			SoapVersion::V12 => f.write_str("1.2"),
		}
	}
}

/// Wrap a payload document into a SOAP envelope for `operation`.
///
/// The payload goes inside `<nfeDadosMsg>` under the operation element, both in the service
/// namespace; the payload keeps its own default namespace declaration.
pub fn build_envelope(
	version: SoapVersion,
	service_ns: &str,
	operation: &str,
	payload: &str,
) -> String {
	format!(
		concat!(
			r#"<?xml version="1.0" encoding="utf-8"?>"#,
			r#"<soap:Envelope xmlns:soap="{env}">"#,
			r#"<soap:Body><{op} xmlns="{ns}"><nfeDadosMsg>{payload}</nfeDadosMsg></{op}></soap:Body>"#,
			r#"</soap:Envelope>"#,
		),
		env = version.envelope_ns(),
		op = operation,
		ns = service_ns,
		payload = payload,
	)
}

/// HTTP headers for a SOAP call.
pub fn headers(
	version: SoapVersion,
	service_ns: &str,
	operation: &str,
) -> Vec<(&'static str, String)> {
	let action = format!("{service_ns}/{operation}");
	match version {
		SoapVersion::V11 => vec![
			("Content-Type", "text/xml; charset=utf-8".to_string()),
			("SOAPAction", format!("\"{action}\"")),
			("Accept", ACCEPT.to_string()),
		],
		SoapVersion::V12 => vec![
			(
				"Content-Type",
				format!("application/soap+xml; charset=utf-8; action=\"{action}\""),
			),
			("Accept", ACCEPT.to_string()),
		],
	}
}

/// Locate the result element `{namespace}local` in a SOAP response and hand it to `f`.
///
/// Falls back to a lookup by local name only, for gateways that strip namespaces. Fails with
/// `UnparsableResponse` when the body is not XML or the element is absent.
pub fn with_result<T>(
	body: &str,
	namespace: &str,
	local: &str,
	f: impl FnOnce(roxmltree::Node<'_, '_>) -> Result<T, ProtocolError>,
) -> Result<T, ProtocolError> {
	let doc = roxmltree::Document::parse(body)
		.map_err(|e| ProtocolError::UnparsableResponse(format!("response is not XML: {e}")))?;

	let node = doc
		.descendants()
		.find(|n| n.has_tag_name((namespace, local)))
		.or_else(|| doc.descendants().find(|n| n.tag_name().name() == local));

	match node {
		Some(node) => f(node),
		None => {
			let fault = doc
				.descendants()
				.find(|n| matches!(n.tag_name().name(), "faultstring" | "Text"))
				.and_then(|n| n.text())
				.map(|t| format!(" (fault: {})", t.trim()))
				.unwrap_or_default();
			Err(ProtocolError::UnparsableResponse(format!(
				"{local} not found in response{fault}"
			)))
		}
	}
}

/// Text of the first descendant of `node` with local name `local`.
pub fn descendant_text(node: roxmltree::Node<'_, '_>, local: &str) -> Option<String> {
	node.descendants()
		.find(|n| n.is_element() && n.tag_name().name() == local)
		.and_then(|n| n.text())
		.map(|t| t.trim().to_string())
}

/// Escape character data the way exclusive/inclusive C14N 1.0 writes it.
pub fn escape_text(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for c in raw.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'\r' => out.push_str("&#xD;"),
			other => out.push(other),
		}
	}
	out
}

/// Escape an attribute value the way C14N 1.0 writes it.
pub fn escape_attr(raw: &str) -> String {
	let mut out = String::with_capacity(raw.len());
	for c in raw.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'"' => out.push_str("&quot;"),
			'\t' => out.push_str("&#x9;"),
			'\n' => out.push_str("&#xA;"),
			'\r' => out.push_str("&#xD;"),
			other => out.push(other),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn envelope_carries_operation_and_payload() {
		let env = build_envelope(
			SoapVersion::V12,
			NS_DIST_WS,
			OP_DISTRIBUTION,
			"<distDFeInt/>",
		);
		assert!(env.contains(NS_SOAP12));
		assert!(env.contains(
			"<nfeDistDFeInteresse xmlns=\"http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe\"><nfeDadosMsg><distDFeInt/></nfeDadosMsg>"
		));
		roxmltree::Document::parse(&env).unwrap();
	}

	#[test]
	fn headers_differ_per_version() {
		let h11 = headers(SoapVersion::V11, NS_DIST_WS, OP_DISTRIBUTION);
		assert!(h11.iter().any(|(k, v)| *k == "SOAPAction"
			&& v == "\"http://www.portalfiscal.inf.br/nfe/wsdl/NFeDistribuicaoDFe/nfeDistDFeInteresse\""));

		let h12 = headers(SoapVersion::V12, NS_DIST_WS, OP_DISTRIBUTION);
		assert!(h12.iter().all(|(k, _)| *k != "SOAPAction"));
		assert!(h12[0].1.starts_with("application/soap+xml"));
	}

	#[test]
	fn result_lookup_falls_back_to_local_name() {
		let qualified = r#"<Envelope><Body><retDistDFeInt xmlns="http://www.portalfiscal.inf.br/nfe"><cStat>137</cStat></retDistDFeInt></Body></Envelope>"#;
		let stripped = r#"<Envelope><Body><retDistDFeInt><cStat>138</cStat></retDistDFeInt></Body></Envelope>"#;

		let code = |body| {
			with_result(body, NS_NFE, "retDistDFeInt", |node| {
				Ok(descendant_text(node, "cStat"))
			})
			.unwrap()
		};
		assert_eq!(code(qualified).as_deref(), Some("137"));
		assert_eq!(code(stripped).as_deref(), Some("138"));

		let err = with_result(
			"<Envelope><Body><Fault><faultstring>boom</faultstring></Fault></Body></Envelope>",
			NS_NFE,
			"retDistDFeInt",
			|_| Ok(()),
		)
		.unwrap_err();
		assert!(matches!(err, ProtocolError::UnparsableResponse(ref d) if d.contains("boom")));
	}

	#[test]
	fn c14n_escaping() {
		assert_eq!(escape_text("a & <b>\r"), "a &amp; &lt;b&gt;&#xD;");
		assert_eq!(escape_attr("\"x\"\t\n"), "&quot;x&quot;&#x9;&#xA;");
	}
}
