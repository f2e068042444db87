//! DNS-over-HTTPS lookup of the ECH configuration
//!
//! Queries the HTTPS (type 65) record for the configured domain and extracts
//! the `ech` SvcParam (key 5), which carries the raw ECHConfigList.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use tracing::debug;

use crate::error::{Error, Result};

const TYPE_HTTPS: u16 = 65;
const SVCPARAM_ECH: u16 = 5;

const DOH_TIMEOUT: Duration = Duration::from_secs(10);

/// Query the ECH config list for `domain` via the given DoH server.
///
/// `doh_server` may omit the scheme (`dns.alidns.com/dns-query`); https is
/// assumed. The request deliberately bypasses any system proxy: this lookup
/// is what makes the tunnel dialable in the first place.
pub async fn query_ech_config(domain: &str, doh_server: &str) -> Result<Vec<u8>> {
    let dns_query = build_dns_query(domain, TYPE_HTTPS);
    let dns_base64 = URL_SAFE_NO_PAD.encode(&dns_query);

    let base_url = if doh_server.starts_with("http://") || doh_server.starts_with("https://") {
        doh_server.to_string()
    } else {
        format!("https://{}", doh_server)
    };
    let separator = if base_url.contains('?') { "&" } else { "?" };
    let doh_url = format!("{}{}dns={}", base_url, separator, dns_base64);

    debug!("DoH query for {} via {}", domain, base_url);

    let client = reqwest::Client::builder()
        .timeout(DOH_TIMEOUT)
        .no_proxy()
        .build()
        .map_err(|e| Error::Dns(e.to_string()))?;

    let response = client
        .get(&doh_url)
        .header("Accept", "application/dns-message")
        .send()
        .await
        .map_err(|e| Error::Dns(format!("DoH request failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(Error::Dns(format!(
            "DoH server returned {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Dns(format!("failed to read DoH response: {}", e)))?;

    match parse_dns_response(&body)? {
        Some(ech) => {
            debug!("found ECH config: {} bytes", ech.len());
            Ok(ech)
        }
        None => Err(Error::Ech(format!(
            "no HTTPS record with ech parameter for {}",
            domain
        ))),
    }
}

/// Build a single-question DNS query in wire format.
fn build_dns_query(domain: &str, qtype: u16) -> Vec<u8> {
    let mut query = Vec::with_capacity(512);

    // Header: id 1, standard query with RD, one question
    query.extend_from_slice(&[
        0x00, 0x01, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    ]);

    for label in domain.split('.') {
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0x00);

    query.extend_from_slice(&qtype.to_be_bytes());
    query.extend_from_slice(&1u16.to_be_bytes()); // class IN

    query
}

/// Walk the answer section for an HTTPS record carrying an `ech` SvcParam.
///
/// Returns `Ok(None)` when the response is well-formed but carries no usable
/// record. Answer names may be either pointer-compressed (`0xC0 xx`) or plain
/// label sequences.
fn parse_dns_response(response: &[u8]) -> Result<Option<Vec<u8>>> {
    if response.len() < 12 {
        return Err(Error::Dns("DNS response too short".into()));
    }

    let ancount = u16::from_be_bytes([response[6], response[7]]);
    if ancount == 0 {
        return Ok(None);
    }

    // Skip the question: QNAME labels, then QTYPE + QCLASS
    let mut offset = 12;
    while offset < response.len() && response[offset] != 0 {
        offset += response[offset] as usize + 1;
    }
    offset += 5;

    for _ in 0..ancount {
        if offset >= response.len() {
            break;
        }

        if response[offset] & 0xC0 == 0xC0 {
            offset += 2;
        } else {
            while offset < response.len() && response[offset] != 0 {
                offset += response[offset] as usize + 1;
            }
            offset += 1;
        }

        if offset + 10 > response.len() {
            break;
        }

        let rr_type = u16::from_be_bytes([response[offset], response[offset + 1]]);
        offset += 8; // TYPE + CLASS + TTL

        let data_len = u16::from_be_bytes([response[offset], response[offset + 1]]) as usize;
        offset += 2;

        if offset + data_len > response.len() {
            break;
        }

        let data = &response[offset..offset + data_len];
        offset += data_len;

        if rr_type == TYPE_HTTPS {
            if let Some(ech) = parse_https_record(data) {
                return Ok(Some(ech));
            }
        }
    }

    Ok(None)
}

/// Parse HTTPS RR rdata: priority, target name, then SvcParams.
fn parse_https_record(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() < 2 {
        return None;
    }

    let mut offset = 2; // priority

    // Target name: a single zero octet means the root
    if offset < data.len() && data[offset] == 0 {
        offset += 1;
    } else {
        while offset < data.len() && data[offset] != 0 {
            offset += data[offset] as usize + 1;
        }
        offset += 1;
    }

    while offset + 4 <= data.len() {
        let key = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        offset += 4;

        if offset + length > data.len() {
            break;
        }

        let value = &data[offset..offset + length];
        offset += length;

        if key == SVCPARAM_ECH {
            return Some(value.to_vec());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble a DNS response with the given answer records, each built by
    /// `build_answer`. Question is `example.com IN HTTPS`.
    fn build_response(answers: &[Vec<u8>]) -> Vec<u8> {
        let mut resp = Vec::new();
        resp.extend_from_slice(&[0x00, 0x01, 0x81, 0x80]);
        resp.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        resp.extend_from_slice(&(answers.len() as u16).to_be_bytes());
        resp.extend_from_slice(&[0, 0, 0, 0]); // NSCOUNT, ARCOUNT

        // Question
        for label in ["example", "com"] {
            resp.push(label.len() as u8);
            resp.extend_from_slice(label.as_bytes());
        }
        resp.push(0);
        resp.extend_from_slice(&TYPE_HTTPS.to_be_bytes());
        resp.extend_from_slice(&1u16.to_be_bytes());

        for answer in answers {
            resp.extend_from_slice(answer);
        }
        resp
    }

    /// One answer record. `name` is raw wire bytes (pointer or labels).
    fn build_answer(name: &[u8], rr_type: u16, rdata: &[u8]) -> Vec<u8> {
        let mut rr = Vec::new();
        rr.extend_from_slice(name);
        rr.extend_from_slice(&rr_type.to_be_bytes());
        rr.extend_from_slice(&1u16.to_be_bytes()); // class IN
        rr.extend_from_slice(&300u32.to_be_bytes()); // TTL
        rr.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        rr.extend_from_slice(rdata);
        rr
    }

    /// HTTPS rdata with the given SvcParams after priority 1 + root target.
    fn build_https_rdata(params: &[(u16, &[u8])]) -> Vec<u8> {
        let mut rdata = vec![0x00, 0x01, 0x00];
        for (key, value) in params {
            rdata.extend_from_slice(&key.to_be_bytes());
            rdata.extend_from_slice(&(value.len() as u16).to_be_bytes());
            rdata.extend_from_slice(value);
        }
        rdata
    }

    const POINTER_NAME: &[u8] = &[0xC0, 0x0C];

    #[test]
    fn test_extracts_ech_param_verbatim() {
        let ech = b"\x00\x08fake-ech";
        let rdata = build_https_rdata(&[(1, b"\x02h2"), (SVCPARAM_ECH, ech)]);
        let resp = build_response(&[build_answer(POINTER_NAME, TYPE_HTTPS, &rdata)]);

        let got = parse_dns_response(&resp).unwrap().unwrap();
        assert_eq!(got, ech);
    }

    #[test]
    fn test_label_sequence_name() {
        let ech = b"ech-bytes";
        let rdata = build_https_rdata(&[(SVCPARAM_ECH, ech)]);
        // Uncompressed owner name: example.com
        let name = b"\x07example\x03com\x00";
        let resp = build_response(&[build_answer(name, TYPE_HTTPS, &rdata)]);

        assert_eq!(parse_dns_response(&resp).unwrap().unwrap(), ech);
    }

    #[test]
    fn test_no_answers_yields_empty() {
        let resp = build_response(&[]);
        assert!(parse_dns_response(&resp).unwrap().is_none());
    }

    #[test]
    fn test_https_record_without_ech_yields_empty() {
        let rdata = build_https_rdata(&[(1, b"\x02h2"), (4, &[1, 2, 3, 4])]);
        let resp = build_response(&[build_answer(POINTER_NAME, TYPE_HTTPS, &rdata)]);
        assert!(parse_dns_response(&resp).unwrap().is_none());
    }

    #[test]
    fn test_skips_non_https_answers() {
        let a_record = build_answer(POINTER_NAME, 1, &[93, 184, 216, 34]);
        let ech = b"listed";
        let https = build_answer(
            POINTER_NAME,
            TYPE_HTTPS,
            &build_https_rdata(&[(SVCPARAM_ECH, ech)]),
        );
        let resp = build_response(&[a_record, https]);

        assert_eq!(parse_dns_response(&resp).unwrap().unwrap(), ech);
    }

    #[test]
    fn test_truncated_response_is_error() {
        assert!(parse_dns_response(&[0x00, 0x01, 0x81]).is_err());
    }

    #[test]
    fn test_query_layout() {
        let q = build_dns_query("a.bc", TYPE_HTTPS);
        // header + (1+1) + (1+2) + root + type + class
        assert_eq!(q.len(), 12 + 2 + 3 + 1 + 4);
        assert_eq!(&q[12..], b"\x01a\x02bc\x00\x00\x41\x00\x01");
    }
}
