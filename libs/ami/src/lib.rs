//! Minimal Asterisk Manager Interface (AMI) client. The wire protocol is
//! line-oriented `Key: Value` blocks terminated by a blank line; we speak just
//! enough of it to log in, originate a SendFax call, and listen for the
//! `FaxResult` user event emitted by the dialplan.

mod client;

pub use client::{AmiClient, AmiConfig, AmiMessage, FaxResultHandler, probe};
