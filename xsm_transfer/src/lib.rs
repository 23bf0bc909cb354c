pub mod body_type;
pub mod download;
pub mod upload;

pub use body_type::StructuredBodyType;
pub use download::ResponseBody;
pub use upload::{
    crc64_header_value, uses_framing, FramedUpload, TransferValidation, UploadBody,
    STRUCTURED_MESSAGE_THRESHOLD,
};
