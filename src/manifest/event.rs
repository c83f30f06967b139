//! Manifestation event document.

use crate::config::Environment;
use crate::manifest::ManifestError;
use crate::utils::{only_digits, truncate_chars};
use crate::ws::DocumentKey;
use crate::ws::soap::{NS_NFE, escape_attr, escape_text};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use std::fmt;
use std::str::FromStr;

/// Layout version of `envEvento`, `evento` and `detEvento`
pub const EVENT_VERSION: &str = "1.00";
/// `xJust` length limit
pub const MAX_JUSTIFICATION: usize = 255;
/// Brasília offset used for `dhEvento`
const BRT_OFFSET_SECS: i32 = -3 * 3600;

/// The four recipient manifestation events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// 210200
    Confirmation,
    /// 210210
    Awareness,
    /// 210220
    Unawareness,
    /// 210240
    NotPerformed,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::Confirmation,
        EventType::Awareness,
        EventType::Unawareness,
        EventType::NotPerformed,
    ];

    /// `tpEvento` code
    pub fn code(&self) -> &'static str {
        match self {
            EventType::Confirmation => "210200",
            EventType::Awareness => "210210",
            EventType::Unawareness => "210220",
            EventType::NotPerformed => "210240",
        }
    }

    /// `descEvento` text, exactly as the schema requires it
    pub fn description(&self) -> &'static str {
        match self {
            EventType::Confirmation => "Confirmação da Operação",
            EventType::Awareness => "Ciência da Operação",
            EventType::Unawareness => "Desconhecimento da Operação",
            EventType::NotPerformed => "Operação não Realizada",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for EventType {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        EventType::ALL
            .into_iter()
            .find(|t| t.code() == s)
            .ok_or_else(|| ManifestError::UnknownEventType(s.to_string()))
    }
}

/// One manifestation event, ready to be rendered and signed
#[derive(Debug, Clone)]
pub struct ManifestationEvent {
    pub environment: Environment,
    /// Author tax id, digits only
    pub tax_id: String,
    pub key: DocumentKey,
    pub event_type: EventType,
    pub sequence: u8,
    /// `cOrgao`: `91` for the national authority, the UF code otherwise
    pub organ: String,
    pub timestamp: DateTime<FixedOffset>,
    pub justification: Option<String>,
}

impl ManifestationEvent {
    pub fn new(
        environment: Environment,
        tax_id: &str,
        key: DocumentKey,
        event_type: EventType,
        sequence: u8,
        organ: &str,
    ) -> Self {
        Self {
            environment,
            tax_id: only_digits(tax_id),
            key,
            event_type,
            sequence,
            organ: organ.to_string(),
            timestamp: brasilia_now(),
            justification: None,
        }
    }

    /// Attach an `xJust`, capped at 255 characters; blank text is ignored.
    pub fn with_justification(mut self, justification: Option<&str>) -> Self {
        self.justification = justification
            .map(str::trim)
            .filter(|j| !j.is_empty())
            .map(|j| truncate_chars(j, MAX_JUSTIFICATION));
        self
    }

    /// `infEvento/@Id`, the signature reference target
    pub fn id(&self) -> String {
        format!(
            "ID{}{}{:02}",
            self.event_type.code(),
            self.key,
            self.sequence
        )
    }

    /// `infEvento` in canonical form.
    ///
    /// With `declare_ns` the default namespace is written on the element, which is how the element
    /// canonicalizes on its own (the namespace is in scope from `envEvento`); without it, the form to
    /// embed in the document.
    pub fn inf_evento(&self, declare_ns: bool) -> String {
        let ns = if declare_ns {
            format!(r#" xmlns="{NS_NFE}""#)
        } else {
            String::new()
        };
        let party = if self.tax_id.len() == 11 { "CPF" } else { "CNPJ" };
        let justification = self
            .justification
            .as_deref()
            .map(|j| format!("<xJust>{}</xJust>", escape_text(j)))
            .unwrap_or_default();

        format!(
            concat!(
                r#"<infEvento{ns} Id="{id}">"#,
                "<cOrgao>{organ}</cOrgao>",
                "<tpAmb>{env}</tpAmb>",
                "<{party}>{tax_id}</{party}>",
                "<chNFe>{key}</chNFe>",
                "<dhEvento>{dh}</dhEvento>",
                "<tpEvento>{tp}</tpEvento>",
                "<nSeqEvento>{seq}</nSeqEvento>",
                "<verEvento>{ver}</verEvento>",
                r#"<detEvento versao="{ver}"><descEvento>{desc}</descEvento>{just}</detEvento>"#,
                "</infEvento>",
            ),
            ns = ns,
            id = escape_attr(&self.id()),
            organ = escape_text(&self.organ),
            env = self.environment.code(),
            party = party,
            tax_id = self.tax_id,
            key = self.key,
            dh = self.timestamp.format("%Y-%m-%dT%H:%M:%S%:z"),
            tp = self.event_type.code(),
            seq = self.sequence,
            ver = EVENT_VERSION,
            desc = escape_text(self.event_type.description()),
            just = justification,
        )
    }
}

/// Wrap signed `evento` elements into the `envEvento` batch.
pub fn batch_envelope(batch_id: i64, signed_events: &str) -> String {
    format!(
        r#"<envEvento xmlns="{NS_NFE}" versao="{EVENT_VERSION}"><idLote>{batch_id}</idLote>{signed_events}</envEvento>"#
    )
}

/// Current time at the Brasília offset
pub fn brasilia_now() -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(BRT_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    Utc::now().with_timezone(&offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const KEY: &str = "35240112345678000195550010000000011000000010";

    fn event() -> ManifestationEvent {
        let mut event = ManifestationEvent::new(
            Environment::Staging,
            "12.345.678/0001-95",
            DocumentKey::parse(KEY).unwrap(),
            EventType::Awareness,
            1,
            "91",
        );
        event.timestamp = FixedOffset::east_opt(BRT_OFFSET_SECS)
            .unwrap()
            .with_ymd_and_hms(2024, 1, 15, 10, 30, 0)
            .unwrap();
        event
    }

    #[test]
    fn event_vocabulary() {
        let codes: Vec<&str> = EventType::ALL.iter().map(EventType::code).collect();
        assert_eq!(codes, vec!["210200", "210210", "210220", "210240"]);
        assert_eq!("210240".parse::<EventType>().unwrap(), EventType::NotPerformed);
        assert_eq!(EventType::Unawareness.description(), "Desconhecimento da Operação");
        assert!("110111".parse::<EventType>().is_err());
    }

    #[test]
    fn id_combines_type_key_and_sequence() {
        assert_eq!(event().id(), format!("ID210210{KEY}01"));
    }

    #[test]
    fn inf_evento_layout() {
        let xml = event().inf_evento(true);
        assert_eq!(
            xml,
            format!(
                "<infEvento xmlns=\"http://www.portalfiscal.inf.br/nfe\" Id=\"ID210210{KEY}01\"><cOrgao>91</cOrgao><tpAmb>2</tpAmb><CNPJ>12345678000195</CNPJ><chNFe>{KEY}</chNFe><dhEvento>2024-01-15T10:30:00-03:00</dhEvento><tpEvento>210210</tpEvento><nSeqEvento>1</nSeqEvento><verEvento>1.00</verEvento><detEvento versao=\"1.00\"><descEvento>Ciência da Operação</descEvento></detEvento></infEvento>"
            )
        );
        assert!(event().inf_evento(false).starts_with("<infEvento Id="));
    }

    #[test]
    fn justification_is_escaped_and_capped() {
        let long = "x".repeat(300);
        let event = event().with_justification(Some(&long));
        assert_eq!(event.justification.as_ref().unwrap().chars().count(), 255);

        let event = self::event().with_justification(Some("a < b & c"));
        assert!(event.inf_evento(false).contains("<xJust>a &lt; b &amp; c</xJust>"));

        assert!(self::event().with_justification(Some("  ")).justification.is_none());
    }
}
