pub mod chunked;
pub mod codec;
pub mod frame;
pub mod reassembler;
pub mod slot_status;

pub use chunked::{ChunkedWriter, WriteStep};
pub use codec::CcidCodec;
pub use frame::{
    CcidCommand, CcidHeader, CcidResponse, CommandCode, Decoded, ResponseCode, decode,
    decode_with_limit,
};
pub use reassembler::{Feed, Reassembler};
pub use slot_status::{
    DeviceStatus, IccStatus, SlotCode, declared_slot_count, parse_ccid_header_error,
    parse_ccid_header_status, parse_device_status_bitmap,
};
