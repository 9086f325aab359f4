//! 平台交易签名
//! EIP-155 legacy 交易：RLP 编码 + Keccak-256 + secp256k1 可恢复签名

use anyhow::{Context, Result};
use k256::ecdsa::{RecoveryId, SigningKey, VerifyingKey};
use sha3::{Digest, Keccak256};

/// 待签名的 legacy 交易
#[derive(Debug, Clone)]
pub struct LegacyTransaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// None 表示合约创建（本系统不会用到）
    pub to: Option<[u8; 20]>,
    pub value: u128,
    pub data: Vec<u8>,
}

pub struct TxSigner {
    signing_key: SigningKey,
    address: String,
    chain_id: u64,
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// RLP 整数编码：最小化大端字节，0 编码为空串
fn append_uint(stream: &mut rlp::RlpStream, bytes: &[u8]) {
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    stream.append(&&bytes[first_nonzero..]);
}

fn append_tx_body(stream: &mut rlp::RlpStream, tx: &LegacyTransaction) {
    append_uint(stream, &tx.nonce.to_be_bytes());
    append_uint(stream, &tx.gas_price.to_be_bytes());
    append_uint(stream, &tx.gas_limit.to_be_bytes());
    match &tx.to {
        Some(addr) => {
            stream.append(&addr.as_slice());
        }
        None => {
            stream.append_empty_data();
        }
    }
    append_uint(stream, &tx.value.to_be_bytes());
    stream.append(&tx.data.as_slice());
}

impl TxSigner {
    pub fn from_hex(private_key_hex: &str, chain_id: u64) -> Result<Self> {
        let raw = hex::decode(private_key_hex.trim_start_matches("0x"))
            .context("Platform private key is not valid hex")?;
        let signing_key =
            SigningKey::from_slice(&raw).context("Platform private key is not a valid secp256k1 scalar")?;
        let address = derive_address(signing_key.verifying_key());

        Ok(Self {
            signing_key,
            address,
            chain_id,
        })
    }

    /// 平台签名地址（0x hex，小写）
    pub fn address(&self) -> &str {
        &self.address
    }

    /// 签名并返回 0x 前缀的原始交易，可直接 eth_sendRawTransaction
    pub fn sign_transaction(&self, tx: &LegacyTransaction) -> Result<String> {
        // EIP-155 签名载荷：(nonce, gasPrice, gas, to, value, data, chainId, 0, 0)
        let mut payload = rlp::RlpStream::new_list(9);
        append_tx_body(&mut payload, tx);
        append_uint(&mut payload, &self.chain_id.to_be_bytes());
        payload.append_empty_data();
        payload.append_empty_data();

        let sighash = keccak256(&payload.out());

        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(&sighash)
            .context("Failed to sign transaction")?;
        // 低 s 规范化，恢复位随之翻转
        let (signature, recovery_id) = match signature.normalize_s() {
            Some(normalized) => (
                normalized,
                RecoveryId::from_byte(recovery_id.to_byte() ^ 1)
                    .context("Invalid recovery id after normalization")?,
            ),
            None => (signature, recovery_id),
        };

        let v = self.chain_id * 2 + 35 + recovery_id.to_byte() as u64;

        let r = signature.r().to_bytes();
        let s = signature.s().to_bytes();

        let mut signed = rlp::RlpStream::new_list(9);
        append_tx_body(&mut signed, tx);
        append_uint(&mut signed, &v.to_be_bytes());
        append_uint(&mut signed, r.as_slice());
        append_uint(&mut signed, s.as_slice());

        Ok(format!("0x{}", hex::encode(signed.out())))
    }
}

/// 以太坊地址推导：keccak256(未压缩公钥)[12..]
fn derive_address(key: &VerifyingKey) -> String {
    let uncompressed = key.to_encoded_point(false);
    let digest = keccak256(&uncompressed.as_bytes()[1..]);
    format!("0x{}", hex::encode(&digest[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    // 熟知的测试私钥（Hardhat account #0）
    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn derives_known_address() {
        let signer = TxSigner::from_hex(TEST_KEY, 1).unwrap();
        assert_eq!(
            signer.address(),
            "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266"
        );
    }

    #[test]
    fn accepts_0x_prefixed_key() {
        let with_prefix = TxSigner::from_hex(&format!("0x{}", TEST_KEY), 1).unwrap();
        let without = TxSigner::from_hex(TEST_KEY, 1).unwrap();
        assert_eq!(with_prefix.address(), without.address());
    }

    #[test]
    fn signed_tx_is_valid_rlp_list() {
        let signer = TxSigner::from_hex(TEST_KEY, 420_420_420).unwrap();
        let tx = LegacyTransaction {
            nonce: 7,
            gas_price: 1_000_000_000,
            gas_limit: 21_000,
            to: Some([0x11; 20]),
            value: 1_000_000_000_000_000_000,
            data: vec![],
        };
        let raw = signer.sign_transaction(&tx).unwrap();
        assert!(raw.starts_with("0x"));

        let bytes = hex::decode(raw.trim_start_matches("0x")).unwrap();
        let decoded = rlp::Rlp::new(&bytes);
        assert!(decoded.is_list());
        assert_eq!(decoded.item_count().unwrap(), 9);
        // v 编码了 chain id（EIP-155）
        let v: u64 = decoded.val_at(6).unwrap();
        assert!(v == 420_420_420 * 2 + 35 || v == 420_420_420 * 2 + 36);
    }

    #[test]
    fn signing_is_deterministic() {
        let signer = TxSigner::from_hex(TEST_KEY, 1).unwrap();
        let tx = LegacyTransaction {
            nonce: 0,
            gas_price: 20_000_000_000,
            gas_limit: 50_000,
            to: Some([0xaa; 20]),
            value: 0,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        };
        assert_eq!(
            signer.sign_transaction(&tx).unwrap(),
            signer.sign_transaction(&tx).unwrap()
        );
    }

    #[test]
    fn rejects_bad_keys() {
        assert!(TxSigner::from_hex("not-hex", 1).is_err());
        assert!(TxSigner::from_hex("00", 1).is_err());
    }
}
