//! Topology, NAT, path and access list engine of a network policy compiler.

pub mod acl;
pub mod addr;
pub mod config;
pub mod diag;
pub mod export;
pub mod input;
pub mod model;
pub mod nat;
pub mod path;
pub mod pipeline;
pub mod protocol;
pub mod service;
pub mod setup;
pub mod split;
pub mod zone;

pub use acl::{assemble_acls, AclEntry, DeviceAcls, RuleSet};
pub use config::{load_config, Config, ConfigError, IpMode};
pub use diag::{CaptureWriter, CompileError, Diagnostics, Severity, Summary};
pub use export::{nat_export, write_code, write_device, write_nat_export, NatExport, WriteError};
pub use input::{parse_file, parse_json, parse_toml, InputError, ObjectTree};
pub use model::{NatSet, Object, Topology};
pub use nat::{combine_nat_sets, CombinedNatSet};
pub use path::{PathEngine, PathError, PathNode, Walk};
pub use pipeline::{compile, prepare_topology, Compilation};
pub use protocol::{parse_protocol, Protocol};
pub use service::Rule;
