//! L4 checksum completion for frames handed over with `csum_partial` set.
//!
//! Only Ethernet II + IPv4 + TCP/UDP is handled. Anything else is left as is.

const ETH_HLEN: usize = 14;
const ETH_P_IP: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

const TCP_CSUM_OFFSET: usize = 16;
const UDP_CSUM_OFFSET: usize = 6;

/// One's complement sum of big endian 16-bit words, odd byte padded.
pub fn partial_sum(data: &[u8], initial: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum = chunks
        .by_ref()
        .fold(initial, |sum, w| sum.wrapping_add(u16::from_be_bytes([w[0], w[1]]) as u32));
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

pub fn finalize(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute and store the TCP or UDP checksum of an Ethernet frame.
/// Returns whether a checksum was written.
pub fn fixup_l4_checksum(frame: &mut [u8]) -> bool {
    if frame.len() < ETH_HLEN + 20 {
        return false;
    }
    if u16::from_be_bytes([frame[12], frame[13]]) != ETH_P_IP {
        return false;
    }
    let ip = &frame[ETH_HLEN..];
    if ip[0] >> 4 != 4 {
        return false;
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    let total_len = u16::from_be_bytes([ip[2], ip[3]]) as usize;
    if ihl < 20 || total_len < ihl || total_len > ip.len() {
        return false;
    }
    // Fragments other than the first carry no L4 header
    let frag_off = u16::from_be_bytes([ip[6], ip[7]]) & 0x1fff;
    if frag_off != 0 {
        return false;
    }

    let proto = ip[9];
    let csum_offset = match proto {
        IPPROTO_TCP => TCP_CSUM_OFFSET,
        IPPROTO_UDP => UDP_CSUM_OFFSET,
        _ => return false,
    };
    let l4_len = total_len - ihl;
    if l4_len < csum_offset + 2 {
        return false;
    }

    let mut pseudo = [0u8; 12];
    pseudo[0..8].copy_from_slice(&ip[12..20]);
    pseudo[9] = proto;
    pseudo[10..12].copy_from_slice(&(l4_len as u16).to_be_bytes());

    let l4_start = ETH_HLEN + ihl;
    let l4 = &mut frame[l4_start..l4_start + l4_len];
    l4[csum_offset] = 0;
    l4[csum_offset + 1] = 0;

    let mut csum = finalize(partial_sum(l4, partial_sum(&pseudo, 0)));
    if proto == IPPROTO_UDP && csum == 0 {
        // Zero means "no checksum" for UDP
        csum = 0xffff;
    }
    l4[csum_offset..csum_offset + 2].copy_from_slice(&csum.to_be_bytes());
    true
}
