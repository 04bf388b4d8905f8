//! Request text sent to the server
//!
//! ```text
//! <tebis>
//! <szConfigFile>d:/tebis/Anlage/Config.txt</szConfigFile>
//! <szProcedure>LoadData</szProcedure>
//! <arrMsts>4711, 4712</arrMsts>
//! <nNmbX>60</nNmbX>
//! <nCT>1000</nCT>
//! <nTimeR>1700000000000</nTimeR>
//! <tebis>
//! ```

use std::fmt;

use crate::transport::TransportError;

/// Metadata tables available through `GetConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigObject {
    Points,
    VirtualPoints,
    Groups,
    Reductions,
}

impl ConfigObject {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Points => "Msts",
            Self::VirtualPoints => "VMsts",
            Self::Groups => "Grps",
            Self::Reductions => "RsRedCTs",
        }
    }
}

/// Parameters shared by both data procedures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataQuery {
    pub point_ids: Vec<i64>,
    pub sample_count: u32,
    pub resolution_ms: i64,
    pub right_edge_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Procedure {
    GetConfig(ConfigObject),
    /// Binary data query
    LoadData(DataQuery),
    /// Text data query (slow path)
    LoadTextData(DataQuery),
}

impl Procedure {
    fn name(&self) -> &'static str {
        match self {
            Self::GetConfig(_) => "GetConfig",
            Self::LoadData(_) => "LoadData",
            Self::LoadTextData(_) => "JLoadData",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub config_file: String,
    pub procedure: Procedure,
}

impl Request {
    pub fn new(config_file: impl Into<String>, procedure: Procedure) -> Self {
        Self {
            config_file: config_file.into(),
            procedure,
        }
    }

    /// Data requests may be resent after a server error; metadata requests are not.
    pub fn is_data(&self) -> bool {
        !matches!(self.procedure, Procedure::GetConfig(_))
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "<tebis>")?;
        writeln!(f, "<szConfigFile>{}</szConfigFile>", self.config_file)?;
        writeln!(f, "<szProcedure>{}</szProcedure>", self.procedure.name())?;
        match &self.procedure {
            Procedure::GetConfig(object) => {
                writeln!(f, "<szTebObjType>{}</szTebObjType>", object.as_str())?;
            }
            Procedure::LoadData(query) | Procedure::LoadTextData(query) => {
                write!(f, "<arrMsts>")?;
                for (i, id) in query.point_ids.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{id}")?;
                }
                writeln!(f, "</arrMsts>")?;
                writeln!(f, "<nNmbX>{}</nNmbX>", query.sample_count)?;
                writeln!(f, "<nCT>{}</nCT>", query.resolution_ms)?;
                writeln!(f, "<nTimeR>{}</nTimeR>", query.right_edge_ms)?;
            }
        }
        write!(f, "<tebis>")
    }
}

/// Encode text as Latin-1, one byte per character.
pub fn encode_latin1(text: &str) -> Result<Vec<u8>, TransportError> {
    text.char_indices()
        .map(|(offset, ch)| {
            u8::try_from(u32::from(ch)).map_err(|_| TransportError::Encoding { ch, offset })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_request_text() {
        let request = Request::new(
            "d:/tebis/Anlage/Config.txt",
            Procedure::LoadData(DataQuery {
                point_ids: vec![4711, 4712, 4713],
                sample_count: 60,
                resolution_ms: 1000,
                right_edge_ms: 1_700_000_000_000,
            }),
        );
        assert_eq!(
            request.to_string(),
            "<tebis>\n\
             <szConfigFile>d:/tebis/Anlage/Config.txt</szConfigFile>\n\
             <szProcedure>LoadData</szProcedure>\n\
             <arrMsts>4711, 4712, 4713</arrMsts>\n\
             <nNmbX>60</nNmbX>\n\
             <nCT>1000</nCT>\n\
             <nTimeR>1700000000000</nTimeR>\n\
             <tebis>"
        );
        assert!(request.is_data());
    }

    #[test]
    fn config_request_text() {
        let request = Request::new("cfg.txt", Procedure::GetConfig(ConfigObject::Reductions));
        assert_eq!(
            request.to_string(),
            "<tebis>\n<szConfigFile>cfg.txt</szConfigFile>\n<szProcedure>GetConfig</szProcedure>\n<szTebObjType>RsRedCTs</szTebObjType>\n<tebis>"
        );
        assert!(!request.is_data());
    }

    #[test]
    fn text_query_uses_slow_procedure() {
        let query = DataQuery {
            point_ids: vec![1],
            sample_count: 1,
            resolution_ms: 60_000,
            right_edge_ms: 0,
        };
        let text = Request::new("c", Procedure::LoadTextData(query)).to_string();
        assert!(text.contains("<szProcedure>JLoadData</szProcedure>"));
    }

    #[test]
    fn latin1_is_byte_for_byte() {
        assert_eq!(encode_latin1("Grüße").unwrap(), b"Gr\xfc\xdfe");
        let err = encode_latin1("a→b").unwrap_err();
        assert!(matches!(err, TransportError::Encoding { ch: '→', offset: 1 }));
    }
}
