//! Compilation-unit manifests.
//!
//! A manifest describes one piece of compiler output in TOML: the code and
//! data sections as hex, the addresses they are relocated for, the runtime
//! addresses sites resolve against and the site list.
//!
//! ```toml
//! polling_page = 0x300000
//!
//! [unit]
//! name = "caller"
//! code = "e8 00 00 00 00 c3"
//!
//! [layout]
//! code_base = 0x100000
//! data_base = 0x101000
//!
//! [stubs]
//! resolve_static = 0x200100
//!
//! [[site]]
//! kind = "method_call"
//! offset = 0
//! call_type = "invoke_static"
//! method = { name = "callee", descriptor = "()V", static = true }
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::RuntimeConfig;
use crate::jit::codebuf::SectionLayout;
use crate::jit::installer::{
    BlobTarget, CallType, CodeKind, CompiledCode, EntryOffsets, InstallContext, PollKind, Site,
    SiteKind,
};
use crate::jit::stackmap::ReferenceMap;
use crate::runtime::method::{AccessFlags, Method};
use crate::runtime::objects::{CompressedOops, ObjectRef};
use crate::runtime::stubs::RuntimeStubs;

#[derive(Debug, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub polling_page: u64,
    pub unit: UnitSpec,
    pub layout: LayoutSpec,
    #[serde(default)]
    pub stubs: RuntimeStubs,
    /// Overrides the configured encoding when present.
    pub narrow_oops: Option<CompressedOops>,
    #[serde(default, rename = "site")]
    pub sites: Vec<SiteSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnitSpec {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: CodeKind,
    /// Hex bytes; whitespace is ignored.
    pub code: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub verified_entry: u32,
    pub unverified_entry: Option<u32>,
    #[serde(default)]
    pub frame_size: u32,
}

fn default_kind() -> CodeKind {
    CodeKind::Method
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LayoutSpec {
    pub code_base: u64,
    pub data_base: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    pub descriptor: String,
    #[serde(default, rename = "static")]
    pub is_static: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteSpec {
    ObjectConstant {
        offset: u32,
        object: u64,
        #[serde(default)]
        compressed: bool,
    },
    DataReference {
        offset: u32,
        data_offset: u32,
    },
    ForeignCall {
        offset: u32,
        destination: u64,
        debug: Option<ReferenceMap>,
    },
    BlobCall {
        offset: u32,
        code_begin: u64,
        verified_entry: Option<u64>,
        debug: Option<ReferenceMap>,
    },
    MethodCall {
        offset: u32,
        call_type: CallType,
        ic_mark: Option<u32>,
        method: Option<MethodSpec>,
        debug: Option<ReferenceMap>,
    },
    Poll {
        offset: u32,
        /// Raw poll tag: 0 near, 1 far, 2 return near, 3 return far.
        poll: i32,
    },
}

impl SiteSpec {
    fn to_site(&self) -> Result<Site, String> {
        let site = match self {
            SiteSpec::ObjectConstant {
                offset,
                object,
                compressed,
            } => Site::new(
                *offset,
                SiteKind::ObjectConstant {
                    object: ObjectRef(*object),
                    compressed: *compressed,
                },
            ),
            SiteSpec::DataReference {
                offset,
                data_offset,
            } => Site::new(
                *offset,
                SiteKind::DataReference {
                    data_offset: *data_offset,
                },
            ),
            SiteSpec::ForeignCall {
                offset,
                destination,
                debug,
            } => Site::new(
                *offset,
                SiteKind::ForeignCall {
                    destination: *destination,
                    debug: debug.clone(),
                },
            ),
            SiteSpec::BlobCall {
                offset,
                code_begin,
                verified_entry,
                debug,
            } => Site::new(
                *offset,
                SiteKind::BlobCall {
                    target: BlobTarget {
                        code_begin: *code_begin,
                        verified_entry: *verified_entry,
                    },
                    debug: debug.clone(),
                },
            ),
            SiteSpec::MethodCall {
                offset,
                call_type,
                ic_mark,
                method,
                debug,
            } => {
                let method = match method {
                    Some(spec) => {
                        let flags = if spec.is_static {
                            AccessFlags(AccessFlags::STATIC)
                        } else {
                            AccessFlags::default()
                        };
                        let method = Method::new(&spec.name, &spec.descriptor, flags)
                            .map_err(|e| e.to_string())?;
                        Some(Arc::new(method))
                    }
                    None => None,
                };
                Site::new(
                    *offset,
                    SiteKind::MethodCall {
                        call_type: *call_type,
                        ic_mark: *ic_mark,
                        method,
                        debug: debug.clone(),
                    },
                )
            }
            SiteSpec::Poll { offset, poll } => {
                let poll = PollKind::try_from(*poll).map_err(|e| e.to_string())?;
                Site::new(*offset, SiteKind::SafepointPoll { poll })
            }
        };
        Ok(site)
    }
}

/// Decode hex bytes, ignoring whitespace.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits ({})", digits.len()));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            u8::from_str_radix(s, 16).map_err(|_| format!("invalid hex byte {:?}", s))
        })
        .collect()
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, String> {
        let manifest: Manifest =
            toml::from_str(content).map_err(|e| format!("failed to parse manifest: {}", e))?;
        if let Some(oops) = &manifest.narrow_oops {
            oops.validate()?;
        }
        Ok(manifest)
    }

    pub fn layout(&self) -> SectionLayout {
        SectionLayout {
            code_base: self.layout.code_base,
            data_base: self.layout.data_base,
        }
    }

    pub fn context(&self, config: &RuntimeConfig) -> InstallContext {
        InstallContext {
            stubs: self.stubs,
            polling_page: self.polling_page,
            narrow_oops: self.narrow_oops.unwrap_or(config.compressed_oops),
        }
    }

    /// The compiler output the manifest describes.
    pub fn compiled_code(&self) -> Result<CompiledCode, String> {
        let code = parse_hex(&self.unit.code).map_err(|e| format!("unit.code: {}", e))?;
        let mut compiled = CompiledCode::new(&self.unit.name, self.unit.kind, code);
        compiled.data = parse_hex(&self.unit.data).map_err(|e| format!("unit.data: {}", e))?;
        compiled.entries = EntryOffsets {
            verified_entry: self.unit.verified_entry,
            unverified_entry: self.unit.unverified_entry,
        };
        compiled.frame_size = self.unit.frame_size;
        compiled.sites = self
            .sites
            .iter()
            .map(SiteSpec::to_site)
            .collect::<Result<_, _>>()?;
        Ok(compiled)
    }
}
