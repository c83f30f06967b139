//! Web service layer for the national DF-e distribution and event reception services.
//!
//! This module provides endpoint resolution, SOAP envelope handling, the transport strategies that
//! walk the endpoint/version matrix, and the distribution client used by the sync engine.

pub mod client;
pub mod endpoints;
pub mod soap;
pub mod transport;
pub mod types;

pub use client::{DistributionClient, DistributionGateway, select_preferred};
pub use endpoints::{Candidate, EndpointResolver, OperationKind};
pub use soap::SoapVersion;
pub use transport::{
	ExchangeError, HttpExchange, HttpReply, ManualTransport, ReqwestExchange, SoapTransport, WsdlTransport, select_transport,
};
pub use types::*;
