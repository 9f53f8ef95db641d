//! TLS ClientHello inspection

use tracing::trace;

use crate::ProtoError;

/// TLS record content type for handshake messages
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Length of a TLS record header (type, version, length)
pub const TLS_RECORD_HEADER_LEN: usize = 5;

/// Total length of the first TLS record (header included), if enough bytes are
/// present to know it.
pub fn tls_record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < TLS_RECORD_HEADER_LEN {
        return None;
    }
    let payload = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    Some(TLS_RECORD_HEADER_LEN + payload)
}

/// Extract SNI from a TLS ClientHello
///
/// `client_hello` starts at the TLS record header. Only the first record is
/// inspected.
pub fn extract_sni(client_hello: &[u8]) -> Result<String, ProtoError> {
    let mut reader = Reader::new(client_hello);

    // Record header (5) + handshake header (4)
    if reader.u8()? != TLS_HANDSHAKE_RECORD {
        return Err(ProtoError::SniExtractionFailed);
    }
    reader.skip(4)?;
    if reader.u8()? != 0x01 {
        // Not a ClientHello
        return Err(ProtoError::SniExtractionFailed);
    }
    reader.skip(3)?;

    // Client version (2) + random (32)
    reader.skip(2 + 32)?;

    let session_id_len = reader.u8()? as usize;
    reader.skip(session_id_len)?;

    let cipher_suites_len = reader.u16()? as usize;
    reader.skip(cipher_suites_len)?;

    let compression_methods_len = reader.u8()? as usize;
    reader.skip(compression_methods_len)?;

    let extensions_len = reader.u16()? as usize;
    let mut extensions = Reader::new(reader.take(extensions_len)?);

    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_len = extensions.u16()? as usize;
        let ext_data = extensions.take(ext_len)?;

        if ext_type == 0x0000 {
            return parse_server_name(ext_data);
        }
    }

    Err(ProtoError::SniExtractionFailed)
}

/// Parse the server_name extension data
fn parse_server_name(data: &[u8]) -> Result<String, ProtoError> {
    let mut reader = Reader::new(data);

    let list_len = reader.u16()? as usize;
    let mut list = Reader::new(reader.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.u8()?;
        let name_len = list.u16()? as usize;
        let name = list.take(name_len)?;

        // host_name
        if name_type != 0 {
            continue;
        }

        let hostname = std::str::from_utf8(name)
            .map_err(|_| ProtoError::InvalidSni("Invalid UTF-8 in hostname".to_string()))?;
        if hostname.is_empty() {
            return Err(ProtoError::InvalidSni("Empty hostname".to_string()));
        }

        trace!("Extracted SNI hostname: {}", hostname);
        return Ok(hostname.to_string());
    }

    Err(ProtoError::SniExtractionFailed)
}

/// Bounds-checked cursor over the handshake bytes
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if n > self.data.len() {
            return Err(ProtoError::SniExtractionFailed);
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Ok(head)
    }

    fn skip(&mut self, n: usize) -> Result<(), ProtoError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, ProtoError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

/// Builds a minimal ClientHello carrying `hostname` in its SNI extension.
#[doc(hidden)]
pub fn client_hello_for(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();

    let mut server_name = Vec::new();
    server_name.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    server_name.push(0);
    server_name.extend_from_slice(&(name.len() as u16).to_be_bytes());
    server_name.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes());
    extensions.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&server_name);

    let mut body = Vec::new();
    body.extend_from_slice(&[0x03, 0x03]);
    body.extend_from_slice(&[0u8; 32]);
    body.push(0);
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&[0x13, 0x01]);
    body.push(1);
    body.push(0);
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![0x01];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![TLS_HANDSHAKE_RECORD, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
