pub mod error;
pub use error::{HipError, HipResult};

#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{attach_shared_memory, create_shared_memory, RawHandle, SharedMemoryBackend};
    pub mod mbulk;
    pub mod region;
    pub use region::{MifRef, MifRegion}; // re-export for stable path
}

// Module naming follows project convention (HIP = Host Interface Protocol)
#[allow(non_snake_case)]
pub mod HIP {
    pub mod Buffer {
        pub mod Buffer;
        pub mod Buffer_impl;
        pub mod layout;
        pub use Buffer::{HipQueues, Index, QueueId, QueueSide}; // re-export for stable path
    }
    pub mod Structs {
        pub mod Buffer_Structs;
        pub use Buffer_Structs::{Frame, SignalHeader, FW_HEADER_OFFSET, MA_UNITDATA_IND, MA_UNITDATA_REQ, MLME_SET_REQ}; // re-export for stable path
    }
    pub mod builder;
    pub mod checksum;
    pub mod collab;
    pub mod config;
    pub mod irq;
    pub mod mif;
    pub mod peer;
    pub mod policy;
    pub mod rx;
    pub mod smapper;
    pub mod stats;
    pub mod transport;
    pub mod tx;
    pub mod watchdog;
    pub mod worker;

    pub use builder::TransportBuilder;
    pub use irq::RxSource;
    pub use peer::PeerEndpoint;
    pub use transport::{Transport, TransportState};
}

#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}
