//! Signing and finalization
//!
//! Every input is signed with the key its [`InputTemplate`] names, so one
//! unlock draft may use a different lock-branch key per input.
//!
//! Finalization is selected by template:
//!
//! | template           | final form                                 |
//! |--------------------|--------------------------------------------|
//! | `SingleKeyWitness` | witness `[sig, pubkey]`                    |
//! | `CltvP2sh`         | script-sig `[sig, pubkey, redeem script]`  |
//!
//! Finalization is all-or-nothing: if any input lacks what it needs, no input
//! is finalized and no transaction is returned.

use bitcoin::ecdsa::Signature;
use bitcoin::hashes::Hash;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::Message;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{PublicKey, ScriptBuf, Transaction, Witness};
use glacier_core::{KeyError, WalletKeys};
use thiserror::Error;

use crate::draft::{InputTemplate, UnsignedDraft};

#[derive(Error, Debug)]
pub enum SignError {
    #[error("Key derivation failed: {0}")]
    Key(#[from] KeyError),

    #[error("Draft has {inputs} inputs but {templates} templates")]
    TemplateCount { inputs: usize, templates: usize },

    #[error("Input {0} is missing its previous output")]
    MissingUtxo(usize),

    #[error("Input {0} is missing a signature")]
    MissingSignature(usize),

    #[error("Input {0} is missing its redeem script")]
    MissingRedeemScript(usize),

    #[error("Sighash computation failed for input {index}: {reason}")]
    Sighash { index: usize, reason: String },

    #[error("Script-sig push rejected for input {index}: {reason}")]
    Push { index: usize, reason: String },
}

/// Final spending data for one input.
enum Finalized {
    Witness(Witness),
    ScriptSig(ScriptBuf),
}

pub struct Signer<'a> {
    keys: &'a WalletKeys,
}

impl<'a> Signer<'a> {
    pub fn new(keys: &'a WalletKeys) -> Self {
        Self { keys }
    }

    /// Add a SIGHASH_ALL signature to every input.
    pub fn sign(&self, draft: &mut UnsignedDraft) -> Result<(), SignError> {
        check_templates(draft)?;

        let unsigned = draft.psbt.unsigned_tx.clone();
        let mut cache = SighashCache::new(&unsigned);
        let secp = self.keys.secp();

        for (index, template) in draft.templates.iter().enumerate() {
            let input = &draft.psbt.inputs[index];
            let digest = match template {
                InputTemplate::SingleKeyWitness { .. } => {
                    let utxo = input
                        .witness_utxo
                        .as_ref()
                        .ok_or(SignError::MissingUtxo(index))?;
                    cache
                        .p2wpkh_signature_hash(
                            index,
                            &utxo.script_pubkey,
                            utxo.value,
                            EcdsaSighashType::All,
                        )
                        .map_err(|e| SignError::Sighash {
                            index,
                            reason: e.to_string(),
                        })?
                        .to_byte_array()
                }
                InputTemplate::CltvP2sh { redeem_script, .. } => {
                    if input.non_witness_utxo.is_none() {
                        return Err(SignError::MissingUtxo(index));
                    }
                    cache
                        .legacy_signature_hash(index, redeem_script, EcdsaSighashType::All.to_u32())
                        .map_err(|e| SignError::Sighash {
                            index,
                            reason: e.to_string(),
                        })?
                        .to_byte_array()
                }
            };

            let secret = self.keys.secret_key(template.path())?;
            let signature = secp.sign_ecdsa(&Message::from_digest(digest), &secret);
            let pubkey = PublicKey::new(secret.public_key(secp));

            draft.psbt.inputs[index].partial_sigs.insert(
                pubkey,
                Signature {
                    signature,
                    sighash_type: EcdsaSighashType::All,
                },
            );
        }

        log::debug!("Signed {} inputs", draft.templates.len());
        Ok(())
    }

    /// Assemble final spending data for every input and extract the transaction.
    pub fn finalize(&self, mut draft: UnsignedDraft) -> Result<Transaction, SignError> {
        check_templates(&draft)?;

        let mut finals = Vec::with_capacity(draft.templates.len());
        for (index, template) in draft.templates.iter().enumerate() {
            let input = &draft.psbt.inputs[index];
            let pubkey = PublicKey::new(self.keys.public_key(template.path())?);
            let signature = input
                .partial_sigs
                .get(&pubkey)
                .ok_or(SignError::MissingSignature(index))?;

            let finalized = match template {
                InputTemplate::SingleKeyWitness { .. } => {
                    Finalized::Witness(Witness::from_slice(&[
                        signature.to_vec(),
                        pubkey.to_bytes(),
                    ]))
                }
                InputTemplate::CltvP2sh { .. } => {
                    let redeem_script = input
                        .redeem_script
                        .as_ref()
                        .ok_or(SignError::MissingRedeemScript(index))?;
                    Finalized::ScriptSig(cltv_script_sig(
                        index,
                        signature,
                        &pubkey,
                        redeem_script,
                    )?)
                }
            };
            finals.push(finalized);
        }

        for (input, finalized) in draft.psbt.inputs.iter_mut().zip(finals) {
            match finalized {
                Finalized::Witness(witness) => input.final_script_witness = Some(witness),
                Finalized::ScriptSig(script) => input.final_script_sig = Some(script),
            }
            input.partial_sigs.clear();
        }

        Ok(draft.psbt.extract_tx_unchecked_fee_rate())
    }

    pub fn sign_and_finalize(&self, mut draft: UnsignedDraft) -> Result<Transaction, SignError> {
        self.sign(&mut draft)?;
        self.finalize(draft)
    }
}

fn check_templates(draft: &UnsignedDraft) -> Result<(), SignError> {
    let inputs = draft.psbt.inputs.len();
    if inputs != draft.templates.len() || inputs != draft.psbt.unsigned_tx.input.len() {
        return Err(SignError::TemplateCount {
            inputs,
            templates: draft.templates.len(),
        });
    }
    Ok(())
}

/// `<sig> <pubkey> <redeem script>`
fn cltv_script_sig(
    index: usize,
    signature: &Signature,
    pubkey: &PublicKey,
    redeem_script: &ScriptBuf,
) -> Result<ScriptBuf, SignError> {
    let push = |bytes: Vec<u8>| {
        PushBytesBuf::try_from(bytes).map_err(|e| SignError::Push {
            index,
            reason: e.to_string(),
        })
    };

    Ok(Builder::new()
        .push_slice(push(signature.to_vec())?)
        .push_key(pubkey)
        .push_slice(push(redeem_script.to_bytes())?)
        .into_script())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::{LockParams, TxBuilder};
    use crate::registry::LockRegistry;
    use crate::scan::FundingInput;
    use crate::script::LockDescriptor;
    use crate::test_utils::test_keys;
    use bitcoin::script::Instruction;
    use bitcoin::{Amount, Network, OutPoint, Txid};
    use glacier_chain::{ChainSource, MemoryChain};
    use glacier_core::KeyPath;

    fn new_lock_draft(keys: &WalletKeys) -> UnsignedDraft {
        let funding = vec![FundingInput {
            outpoint: OutPoint {
                txid: Txid::from_byte_array([0x11; 32]),
                vout: 1,
            },
            value: Amount::from_sat(5000),
            path: KeyPath::receive(0),
            script_pubkey: keys.receive_address(0).unwrap().script_pubkey(),
        }];
        TxBuilder::new(keys, LockParams::default())
            .build_new_lock(&funding, 200)
            .unwrap()
            .unwrap()
            .draft
    }

    fn unlock_draft(keys: &WalletKeys, heights: &[u32]) -> UnsignedDraft {
        let mut chain = MemoryChain::new(Network::Regtest, 200);
        let mut descriptors = Vec::new();
        for h in heights {
            let lock = LockDescriptor::derive(keys, *h).unwrap();
            chain.fund(&lock.lock_address, Amount::from_sat(3000));
            descriptors.push(lock);
        }
        let locks = LockRegistry::new(keys).status(&chain, descriptors, 200);
        let destination = keys.receive_address(1).unwrap();
        TxBuilder::new(keys, LockParams::default())
            .build_unlock(&chain, &locks, Some(&destination), chain.current_height().unwrap())
            .unwrap()
            .unwrap()
            .draft
    }

    #[test]
    fn test_witness_finalization() {
        let keys = test_keys();
        let tx = Signer::new(&keys)
            .sign_and_finalize(new_lock_draft(&keys))
            .unwrap();

        assert!(tx.input[0].script_sig.is_empty());
        assert_eq!(tx.input[0].witness.len(), 2);
        let pubkey = keys.public_key(KeyPath::receive(0)).unwrap();
        assert_eq!(tx.input[0].witness.nth(1).unwrap(), &pubkey.serialize()[..]);
    }

    #[test]
    fn test_cltv_script_sig_layout() {
        let keys = test_keys();
        let draft = unlock_draft(&keys, &[150]);
        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let tx = Signer::new(&keys).sign_and_finalize(draft).unwrap();

        assert!(tx.input[0].witness.is_empty());
        let pushes: Vec<Vec<u8>> = tx.input[0]
            .script_sig
            .instructions()
            .map(|ins| match ins.unwrap() {
                Instruction::PushBytes(b) => b.as_bytes().to_vec(),
                Instruction::Op(op) => panic!("unexpected opcode {:?}", op),
            })
            .collect();

        assert_eq!(pushes.len(), 3);
        assert_eq!(*pushes[0].last().unwrap(), EcdsaSighashType::All as u8);
        let pubkey = keys.public_key(KeyPath::lock(150)).unwrap();
        assert_eq!(pushes[1], pubkey.serialize().to_vec());
        assert_eq!(pushes[2], lock.redeem_script.to_bytes());
    }

    #[test]
    fn test_signature_verifies_against_lock_key() {
        let keys = test_keys();
        let mut draft = unlock_draft(&keys, &[150]);
        Signer::new(&keys).sign(&mut draft).unwrap();

        let lock = LockDescriptor::derive(&keys, 150).unwrap();
        let cache = SighashCache::new(&draft.psbt.unsigned_tx);
        let sighash = cache
            .legacy_signature_hash(0, &lock.redeem_script, EcdsaSighashType::All.to_u32())
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());

        let pubkey = keys.public_key(KeyPath::lock(150)).unwrap();
        let sig = draft.psbt.inputs[0]
            .partial_sigs
            .get(&PublicKey::new(pubkey))
            .unwrap();
        assert!(keys.secp().verify_ecdsa(&msg, &sig.signature, &pubkey).is_ok());
    }

    #[test]
    fn test_per_input_keys() {
        let keys = test_keys();
        let mut draft = unlock_draft(&keys, &[100, 150]);
        Signer::new(&keys).sign(&mut draft).unwrap();

        for (input, template) in draft.psbt.inputs.iter().zip(&draft.templates) {
            let expected = PublicKey::new(keys.public_key(template.path()).unwrap());
            assert!(input.partial_sigs.contains_key(&expected));
        }
        let tx = Signer::new(&keys).finalize(draft).unwrap();
        assert_eq!(tx.input.len(), 2);
        assert!(tx.input.iter().all(|i| !i.script_sig.is_empty()));
    }

    #[test]
    fn test_finalize_without_signature_fails() {
        let keys = test_keys();
        let draft = unlock_draft(&keys, &[150]);
        assert!(matches!(
            Signer::new(&keys).finalize(draft),
            Err(SignError::MissingSignature(0))
        ));
    }

    #[test]
    fn test_finalize_without_redeem_script_fails() {
        let keys = test_keys();
        let mut draft = unlock_draft(&keys, &[100, 150]);
        let signer = Signer::new(&keys);
        signer.sign(&mut draft).unwrap();
        draft.psbt.inputs[1].redeem_script = None;

        assert!(matches!(
            signer.finalize(draft),
            Err(SignError::MissingRedeemScript(1))
        ));
    }

    #[test]
    fn test_sign_without_utxo_fails() {
        let keys = test_keys();
        let mut draft = new_lock_draft(&keys);
        draft.psbt.inputs[0].witness_utxo = None;
        assert!(matches!(
            Signer::new(&keys).sign(&mut draft),
            Err(SignError::MissingUtxo(0))
        ));
    }

    #[test]
    fn test_template_count_mismatch() {
        let keys = test_keys();
        let mut draft = new_lock_draft(&keys);
        draft.templates.clear();
        assert!(matches!(
            Signer::new(&keys).sign(&mut draft),
            Err(SignError::TemplateCount { .. })
        ));
    }
}
