//! FTP command descriptors and response parsing
//!
//! Each command the engine can send is described once, with the reply code
//! it requires. A mismatching reply fails the whole request with that code.

use crate::{Result, SdkError};

/// Direction of the data phase a command opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpDataDirection {
    None,
    /// Server to controller (RETR, LIST)
    In,
    /// Controller to server (STOR, APPE)
    Out,
}

/// Static description of one FTP command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtpCmdDesc {
    pub verb: &'static str,
    /// The only reply code accepted for this command
    pub resp_code: u16,
    pub data: FtpDataDirection,
}

pub const USER: FtpCmdDesc = FtpCmdDesc {
    verb: "USER",
    resp_code: 230,
    data: FtpDataDirection::None,
};
pub const PASS: FtpCmdDesc = FtpCmdDesc {
    verb: "PASS",
    resp_code: 230,
    data: FtpDataDirection::None,
};
pub const CWD: FtpCmdDesc = FtpCmdDesc {
    verb: "CWD",
    resp_code: 250,
    data: FtpDataDirection::None,
};
pub const RNFR: FtpCmdDesc = FtpCmdDesc {
    verb: "RNFR",
    resp_code: 350,
    data: FtpDataDirection::None,
};
pub const RNTO: FtpCmdDesc = FtpCmdDesc {
    verb: "RNTO",
    resp_code: 250,
    data: FtpDataDirection::None,
};
pub const DELE: FtpCmdDesc = FtpCmdDesc {
    verb: "DELE",
    resp_code: 250,
    data: FtpDataDirection::None,
};
pub const RMD: FtpCmdDesc = FtpCmdDesc {
    verb: "RMD",
    resp_code: 250,
    data: FtpDataDirection::None,
};
pub const EPSV: FtpCmdDesc = FtpCmdDesc {
    verb: "EPSV",
    resp_code: 229,
    data: FtpDataDirection::None,
};
pub const TYPE: FtpCmdDesc = FtpCmdDesc {
    verb: "TYPE",
    resp_code: 200,
    data: FtpDataDirection::None,
};
pub const LIST: FtpCmdDesc = FtpCmdDesc {
    verb: "LIST",
    resp_code: 150,
    data: FtpDataDirection::In,
};
pub const SIZE: FtpCmdDesc = FtpCmdDesc {
    verb: "SIZE",
    resp_code: 213,
    data: FtpDataDirection::None,
};
pub const RETR: FtpCmdDesc = FtpCmdDesc {
    verb: "RETR",
    resp_code: 150,
    data: FtpDataDirection::In,
};
pub const STOR: FtpCmdDesc = FtpCmdDesc {
    verb: "STOR",
    resp_code: 150,
    data: FtpDataDirection::Out,
};
pub const REST: FtpCmdDesc = FtpCmdDesc {
    verb: "REST",
    resp_code: 350,
    data: FtpDataDirection::None,
};
pub const APPE: FtpCmdDesc = FtpCmdDesc {
    verb: "APPE",
    resp_code: 150,
    data: FtpDataDirection::Out,
};

/// Reply code closing a successful data phase
pub const DATA_CLOSE_CODE: u16 = 226;

/// Encode a command line
pub fn encode(desc: &FtpCmdDesc, param: &str) -> String {
    if param.is_empty() {
        format!("{}\r\n", desc.verb)
    } else {
        format!("{} {}\r\n", desc.verb, param)
    }
}

/// One parsed server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpResponse {
    pub code: u16,
    pub text: String,
}

/// Parse the final line of a server reply, `"ddd text"`
pub fn parse_response_line(line: &str) -> Result<FtpResponse> {
    let line = line.trim_end();
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return Err(SdkError::io_failed(-1, format!("bad ftp reply '{line}'")));
    }
    let code: u16 = line[..3]
        .parse()
        .map_err(|_| SdkError::io_failed(-1, format!("bad ftp reply '{line}'")))?;
    let text = line[3..].trim_start_matches([' ', '-']).to_string();
    Ok(FtpResponse { code, text })
}

/// Whether a reply line terminates the response (not a `ddd-` continuation)
pub fn is_final_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 4 && bytes[..3].iter().all(u8::is_ascii_digit) && bytes[3] == b' '
        || bytes.len() == 3 && bytes.iter().all(u8::is_ascii_digit)
}

/// Extract the data port from a 229 reply, `"... (|||51001|)"`
pub fn parse_epsv_port(text: &str) -> Result<u16> {
    let open = text
        .find("(|||")
        .ok_or_else(|| SdkError::io_failed(229, format!("bad EPSV reply '{text}'")))?;
    let rest = &text[open + 4..];
    let end = rest
        .find('|')
        .ok_or_else(|| SdkError::io_failed(229, format!("bad EPSV reply '{text}'")))?;
    rest[..end]
        .parse()
        .map_err(|_| SdkError::io_failed(229, format!("bad EPSV port in '{text}'")))
}

/// Extract the file size from a 213 reply
pub fn parse_size(text: &str) -> Result<u64> {
    text.trim()
        .parse()
        .map_err(|_| SdkError::io_failed(213, format!("bad SIZE reply '{text}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        assert_eq!(encode(&EPSV, ""), "EPSV\r\n");
        assert_eq!(encode(&RETR, "/log/a.bin"), "RETR /log/a.bin\r\n");
        assert_eq!(encode(&TYPE, "I"), "TYPE I\r\n");
    }

    #[test]
    fn test_parse_response_line() {
        let resp = parse_response_line("229 Entering Extended Passive Mode (|||51001|)\r\n").unwrap();
        assert_eq!(resp.code, 229);
        let resp = parse_response_line("213 1024").unwrap();
        assert_eq!(resp.code, 213);
        assert_eq!(resp.text, "1024");
        assert!(parse_response_line("hello").is_err());
    }

    #[test]
    fn test_final_line_detection() {
        assert!(is_final_line("226 Transfer complete"));
        assert!(!is_final_line("226-still going"));
        assert!(is_final_line("230"));
        assert!(!is_final_line("banner"));
    }

    #[test]
    fn test_parse_epsv_port() {
        assert_eq!(
            parse_epsv_port("Entering Extended Passive Mode (|||51001|)").unwrap(),
            51001
        );
        assert!(parse_epsv_port("Entering Passive Mode").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size(" 500 ").unwrap(), 500);
        assert!(parse_size("many").is_err());
    }
}
