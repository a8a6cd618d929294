//! Call templates: segmentation, rewriting and caching

pub mod cache;
pub mod model;
pub mod rewrite;
pub mod segmenter;

pub use cache::{CaseCache, PreparedCase, TemplateSource, CIF_VERSION};
pub use model::{
    CaseInformation, CaseTemplate, Dialog, DialogNumbers, DialogState, FileStamp, RawPacket, SipKind,
    UdpCategory,
};
pub use rewrite::{render, Substitutions};
pub use segmenter::{segment, DialogSegmenter};
