use std::collections::HashMap;

use ethereum_types::H256;

use crate::error::TrieError;
use crate::nibbles::Nibbles;
use crate::node::Node;
use crate::node_hash::{NodeHash, keccak};
use crate::{EMPTY_TRIE_HASH, NodeRLP, PathRLP, ValueRLP};

/// Verifies a merkle proof against the given root hash.
/// Returns the proven value for `key`, or None for a valid proof of absence.
/// Fails if the proof does not link back to the root.
pub fn verify_proof(
    root: H256,
    key: &PathRLP,
    proof: &[NodeRLP],
) -> Result<Option<ValueRLP>, TrieError> {
    if proof.is_empty() {
        if root == *EMPTY_TRIE_HASH {
            return Ok(None);
        }
        return Err(TrieError::Verify(format!(
            "empty proof for non-empty root {root:#x}"
        )));
    }
    let nodes: HashMap<H256, &NodeRLP> = proof.iter().map(|blob| (keccak(blob), blob)).collect();

    let mut path = Nibbles::from_bytes(key);
    let mut expected = NodeHash::Hashed(root);
    loop {
        let node = match expected {
            NodeHash::Hashed(hash) => {
                let blob = nodes.get(&hash).ok_or_else(|| {
                    TrieError::Verify(format!("proof node {hash:#x} is missing"))
                })?;
                Node::decode_raw(blob)?
            }
            // Nodes under 32 bytes are embedded in their parent, which was
            // already authenticated.
            NodeHash::Inline((data, len)) if len > 0 => Node::decode_raw(&data[..len as usize])?,
            NodeHash::Inline(_) => return Ok(None),
        };
        match node {
            Node::Leaf(leaf) => return Ok((leaf.partial == path).then_some(leaf.value)),
            Node::Extension(extension) => {
                if !path.skip_prefix(&extension.prefix) {
                    return Ok(None);
                }
                expected = extension.child.compute_hash();
            }
            Node::Branch(branch) => match path.next_choice() {
                Some(choice) => {
                    if !branch.choices[choice].is_valid() {
                        return Ok(None);
                    }
                    expected = branch.choices[choice].compute_hash();
                }
                None => {
                    let value = branch.value;
                    return Ok((!value.is_empty()).then_some(value));
                }
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Trie;

    fn sample_trie() -> Trie {
        let mut trie = Trie::new_temp();
        for i in 0u8..60 {
            trie.insert(keccak([i]).0.to_vec(), vec![i; 40]).unwrap();
        }
        trie
    }

    #[test]
    fn proves_present_keys() {
        let trie = sample_trie();
        let root = trie.hash();
        for i in [0u8, 17, 42, 59] {
            let key = keccak([i]).0.to_vec();
            let proof = trie.get_proof(&key).unwrap();
            assert_eq!(verify_proof(root, &key, &proof).unwrap(), Some(vec![i; 40]));
        }
    }

    #[test]
    fn proves_absent_keys() {
        let trie = sample_trie();
        let root = trie.hash();
        let absent = keccak([200u8]).0.to_vec();
        let proof = trie.get_proof(&absent).unwrap();
        assert_eq!(verify_proof(root, &absent, &proof).unwrap(), None);
    }

    #[test]
    fn rejects_wrong_root() {
        let trie = sample_trie();
        let key = keccak([1u8]).0.to_vec();
        let proof = trie.get_proof(&key).unwrap();
        let bogus_root = H256::repeat_byte(0x42);
        assert!(verify_proof(bogus_root, &key, &proof).is_err());
    }

    #[test]
    fn rejects_corrupted_node() {
        let trie = sample_trie();
        let root = trie.hash();
        let key = keccak([1u8]).0.to_vec();
        let mut proof = trie.get_proof(&key).unwrap();
        let last = proof.len() - 1;
        proof[last][0] ^= 0xFF;
        assert!(verify_proof(root, &key, &proof).is_err());
    }

    #[test]
    fn empty_proof_only_valid_for_empty_trie() {
        assert_eq!(
            verify_proof(*EMPTY_TRIE_HASH, &b"any".to_vec(), &[]).unwrap(),
            None
        );
        assert!(verify_proof(H256::repeat_byte(1), &b"any".to_vec(), &[]).is_err());
    }

    #[test]
    fn inline_root_proof_verifies() {
        let mut trie = Trie::new_temp();
        trie.insert(b"a".to_vec(), b"b".to_vec()).unwrap();
        let root = trie.hash();
        let key = b"a".to_vec();
        let proof = trie.get_proof(&key).unwrap();
        assert_eq!(proof.len(), 1);
        assert_eq!(verify_proof(root, &key, &proof).unwrap(), Some(b"b".to_vec()));
    }
}
