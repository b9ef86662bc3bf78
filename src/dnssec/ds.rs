//! DS records for the parent side of a delegation.

use ring::digest;

use sluice_base::wire::{WireBuf, WireRead};
use sluice_base::{DomainName, Rdata};

use crate::error::{Error, Result};

use super::keys::keytag;

/// DS digest type numbers.
pub mod digest_type {
    pub const SHA1: u8 = 1;
    pub const SHA256: u8 = 2;
    pub const SHA384: u8 = 4;
}

/// The CDS "please delete the DS" sentinel (RFC 8078): all-zero fields
/// with a one-octet digest.
pub const CDS_DELETE: &[u8] = &[0, 0, 0, 0, 0];

/// Build DS RDATA for a DNSKEY.
///
/// The digest covers the owner name (canonical, lowercased wire form)
/// followed by the DNSKEY RDATA.
pub fn create_ds(owner: &DomainName, dnskey_rdata: &Rdata, digest_alg: u8) -> Result<Rdata> {
    let algorithm = {
        let mut read = WireRead::new(dnskey_rdata.as_slice());
        read.get_u16()?; // flags
        read.get_u8()?; // protocol
        read.get_u8()?
    };

    let hash_alg = match digest_alg {
        digest_type::SHA1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
        digest_type::SHA256 => &digest::SHA256,
        digest_type::SHA384 => &digest::SHA384,
        _ => return Err(Error::Invalid),
    };

    let mut ctx = digest::Context::new(hash_alg);
    ctx.update(owner.to_lowercase().as_wire());
    ctx.update(dnskey_rdata.as_slice());
    let hash = ctx.finish();

    let mut rdata = WireBuf::with_capacity(4 + hash.as_ref().len());
    rdata.put_u16(keytag(dnskey_rdata.as_slice()));
    rdata.put_u8(algorithm);
    rdata.put_u8(digest_alg);
    rdata.put_slice(hash.as_ref());
    Ok(Rdata(rdata.freeze()))
}

//============ Tests ===========================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ds_layout() {
        let owner: DomainName = "example.com.".parse().unwrap();
        let dnskey = Rdata::new(vec![0x01, 0x01, 3, 15, 0xaa, 0xbb, 0xcc]);
        let ds = create_ds(&owner, &dnskey, digest_type::SHA256).unwrap();

        // keytag:u16, algorithm:u8, digestType:u8, then a 32-byte digest.
        assert_eq!(ds.len(), 4 + 32);
        assert_eq!(ds.as_slice()[2], 15);
        assert_eq!(ds.as_slice()[3], digest_type::SHA256);
        assert_eq!(ds.as_slice()[..2], keytag(dnskey.as_slice()).to_be_bytes());

        let sha384 = create_ds(&owner, &dnskey, digest_type::SHA384).unwrap();
        assert_eq!(sha384.len(), 4 + 48);
    }

    #[test]
    fn digest_is_case_insensitive_over_owner() {
        let dnskey = Rdata::new(vec![0x01, 0x01, 3, 15, 0xaa]);
        let lower: DomainName = "example.com.".parse().unwrap();
        let upper: DomainName = "EXAMPLE.COM.".parse().unwrap();
        assert_eq!(
            create_ds(&lower, &dnskey, digest_type::SHA256).unwrap(),
            create_ds(&upper, &dnskey, digest_type::SHA256).unwrap()
        );
    }

    #[test]
    fn unknown_digest_type_is_rejected() {
        let owner: DomainName = "example.com.".parse().unwrap();
        let dnskey = Rdata::new(vec![0x01, 0x01, 3, 15, 0xaa]);
        assert_eq!(
            create_ds(&owner, &dnskey, 9).err(),
            Some(Error::Invalid)
        );
    }
}
