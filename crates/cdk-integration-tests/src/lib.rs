//! Integration test helpers
//!
//! [`TestMint`] is an in-process mint with real keys: it signs with BDHKE, attaches DLEQ
//! proofs, charges input fees, remembers every signature for restore and tracks spent
//! secrets. Failures are injected per call with [`TestMint::inject_fault`] and melt outcomes
//! chosen with [`TestMint::set_melt_outcome`]. [`DirectMintConnection`] plugs it into a
//! wallet without a network.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use cdk::amount::SplitTarget;
use cdk::config::{RetryPolicy, WalletConfig};
use cdk::database::{DynWalletDatabase, WalletMemoryDatabase};
use cdk::dhke::{sign_message, verify_message};
use cdk::fees::calculate_fee;
use cdk::nuts::{
    BlindSignature, BlindSignatureDleq, BlindedMessage, CheckStateRequest, CheckStateResponse,
    CurrencyUnit, Id, KeySet, KeySetInfo, Keys, KeysetResponse, MeltQuoteBolt11Request,
    MeltQuoteBolt11Response, MeltQuoteState, MeltRequest, MintQuoteBolt11Request,
    MintQuoteBolt11Response, MintQuoteState, MintRequest, MintResponse, Proof, ProofState,
    ProofsMethods, PublicKey, RestoreRequest, RestoreResponse, SecretKey, State, SwapRequest,
    SwapResponse,
};
use cdk::util::{random_hex_32, unix_time};
use cdk::wallet::MintConnector;
use cdk::{generate_mnemonic, mnemonic_to_seed, Amount, Error, Wallet, WalletBuilder};

/// Url the test mint is reached at
pub const TEST_MINT_URL: &str = "https://testmint.cdk.example";

/// Denominations `2^0` to `2^MAX_ORDER` get keys
const MAX_ORDER: u32 = 20;

/// Seconds a quote stays valid
const QUOTE_TTL: u64 = 3_600;

/// Mint endpoint a fault is injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MintCall {
    /// Keyset listing and keys
    Keys,
    /// Mint quote and mint quote status
    MintQuote,
    /// Mint
    Mint,
    /// Melt quote and melt quote status
    MeltQuote,
    /// Melt
    Melt,
    /// Swap
    Swap,
    /// Check state
    CheckState,
    /// Restore
    Restore,
}

/// Injected failure of one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Request never reaches the mint
    Unreachable,
    /// Mint processes the request but the response is lost
    ResponseLost,
    /// Mint rejects the request
    Reject(String),
}

/// What the lightning backend does with a melt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeltOutcome {
    /// Payment succeeds with this routing fee, capped at the fee reserve
    Paid {
        /// Routing fee
        fee_paid: Amount,
    },
    /// Payment stays in flight until [`TestMint::settle_melt`]
    Pending,
    /// Payment fails and the inputs are not spent
    Failed,
}

impl Default for MeltOutcome {
    fn default() -> Self {
        Self::Paid {
            fee_paid: Amount::from(1),
        }
    }
}

struct MintKeyset {
    info: KeySetInfo,
    secret_keys: BTreeMap<Amount, SecretKey>,
    keys: Keys,
}

impl MintKeyset {
    fn generate(unit: CurrencyUnit, input_fee_ppk: u64) -> Self {
        let secret_keys: BTreeMap<Amount, SecretKey> = (0..=MAX_ORDER)
            .map(|order| (Amount::from(1u64 << order), SecretKey::generate()))
            .collect();
        let keys = Keys::new(
            secret_keys
                .iter()
                .map(|(amount, key)| (*amount, key.public_key()))
                .collect(),
        );

        Self {
            info: KeySetInfo {
                id: Id::from(&keys),
                unit,
                active: true,
                input_fee_ppk,
            },
            secret_keys,
            keys,
        }
    }

    fn keyset(&self) -> KeySet {
        KeySet {
            id: self.info.id,
            unit: self.info.unit.clone(),
            keys: self.keys.clone(),
        }
    }
}

struct MintQuoteRecord {
    amount: Option<Amount>,
    unit: CurrencyUnit,
    request: String,
    state: MintQuoteState,
    expiry: u64,
}

struct InFlightMelt {
    ys: Vec<PublicKey>,
    outputs: Vec<BlindedMessage>,
    max_change: Amount,
}

struct MeltQuoteRecord {
    amount: Amount,
    fee_reserve: Amount,
    state: MeltQuoteState,
    expiry: u64,
    payment_preimage: Option<String>,
    in_flight: Option<InFlightMelt>,
}

struct MintState {
    unit: CurrencyUnit,
    keysets: Vec<MintKeyset>,
    spent: HashSet<PublicKey>,
    pending: HashSet<PublicKey>,
    signed: HashMap<PublicKey, (BlindedMessage, BlindSignature)>,
    mint_quotes: HashMap<String, MintQuoteRecord>,
    melt_quotes: HashMap<String, MeltQuoteRecord>,
    faults: HashMap<MintCall, VecDeque<Fault>>,
    melt_outcome: MeltOutcome,
    offline: bool,
    dleq: bool,
}

/// In-process mint
pub struct TestMint {
    state: Mutex<MintState>,
}

impl std::fmt::Debug for TestMint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TestMint")
    }
}

fn reject(msg: impl Into<String>) -> Error {
    Error::ProtocolError(msg.into())
}

impl TestMint {
    /// Create a mint with one active keyset for `unit`
    pub fn new(unit: CurrencyUnit, input_fee_ppk: u64) -> Self {
        Self {
            state: Mutex::new(MintState {
                keysets: vec![MintKeyset::generate(unit.clone(), input_fee_ppk)],
                unit,
                spent: HashSet::new(),
                pending: HashSet::new(),
                signed: HashMap::new(),
                mint_quotes: HashMap::new(),
                melt_quotes: HashMap::new(),
                faults: HashMap::new(),
                melt_outcome: MeltOutcome::default(),
                offline: false,
                dleq: true,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MintState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Id of the active keyset
    pub fn active_keyset_id(&self) -> Option<Id> {
        self.lock()
            .keysets
            .iter()
            .rev()
            .find(|k| k.info.active)
            .map(|k| k.info.id)
    }

    /// Deactivate the current keysets and start a new one
    pub fn rotate_keyset(&self, input_fee_ppk: u64) -> Id {
        let mut state = self.lock();

        for keyset in state.keysets.iter_mut() {
            keyset.info.active = false;
        }

        let keyset = MintKeyset::generate(state.unit.clone(), input_fee_ppk);
        let id = keyset.info.id;
        state.keysets.push(keyset);

        tracing::debug!("Test mint rotated to keyset {}", id);

        id
    }

    /// Fail the next call to `call`
    ///
    /// Faults queue up and are consumed in order.
    pub fn inject_fault(&self, call: MintCall, fault: Fault) {
        self.lock().faults.entry(call).or_default().push_back(fault);
    }

    /// Make every call fail as unreachable
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Choose how following melts end
    pub fn set_melt_outcome(&self, outcome: MeltOutcome) {
        self.lock().melt_outcome = outcome;
    }

    /// Attach DLEQ proofs to new signatures
    pub fn set_dleq(&self, dleq: bool) {
        self.lock().dleq = dleq;
    }

    /// Mark a mint quote paid as if its invoice was settled
    pub fn pay_mint_quote(&self, quote_id: &str) -> Result<()> {
        self.settle_mint_quote(quote_id, None)
    }

    /// Pay an open amount mint quote with `amount`
    pub fn pay_open_mint_quote(&self, quote_id: &str, amount: Amount) -> Result<()> {
        self.settle_mint_quote(quote_id, Some(amount))
    }

    fn settle_mint_quote(&self, quote_id: &str, paid: Option<Amount>) -> Result<()> {
        let mut state = self.lock();
        let quote = state
            .mint_quotes
            .get_mut(quote_id)
            .ok_or_else(|| anyhow::anyhow!("unknown mint quote {quote_id}"))?;

        anyhow::ensure!(
            quote.state == MintQuoteState::Unpaid,
            "mint quote {quote_id} is {}",
            quote.state
        );
        match (quote.amount, paid) {
            (Some(_), None) => (),
            (None, Some(amount)) => quote.amount = Some(amount),
            (Some(_), Some(_)) => anyhow::bail!("mint quote {quote_id} has a fixed amount"),
            (None, None) => anyhow::bail!("mint quote {quote_id} needs an amount"),
        }
        quote.state = MintQuoteState::Paid;

        Ok(())
    }

    /// Finish an in-flight melt
    ///
    /// A paid melt spends its inputs and signs change on the blank outputs, charging the
    /// routing fee of the current [`MeltOutcome::Paid`]; a failed one frees its inputs and
    /// returns the quote to `UNPAID`.
    pub fn settle_melt(&self, quote_id: &str, paid: bool) -> Result<()> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let dleq = state.dleq;
        let fee_paid = match state.melt_outcome {
            MeltOutcome::Paid { fee_paid } => fee_paid,
            _ => Amount::ZERO,
        };

        let quote = state
            .melt_quotes
            .get_mut(quote_id)
            .ok_or_else(|| anyhow::anyhow!("unknown melt quote {quote_id}"))?;
        let in_flight = quote
            .in_flight
            .take()
            .ok_or_else(|| anyhow::anyhow!("melt quote {quote_id} is not in flight"))?;

        if !paid {
            quote.state = MeltQuoteState::Unpaid;
            for y in in_flight.ys {
                state.pending.remove(&y);
            }
            return Ok(());
        }

        quote.state = MeltQuoteState::Paid;
        quote.payment_preimage = Some(random_hex_32());
        let change = in_flight
            .max_change
            .saturating_sub(fee_paid.min(quote.fee_reserve));

        for y in in_flight.ys {
            state.pending.remove(&y);
            state.spent.insert(y);
        }

        state.sign_change(&in_flight.outputs, change, dleq)?;

        Ok(())
    }

    /// Whether the mint has seen the secret behind `y` spent
    pub fn is_spent(&self, y: &PublicKey) -> bool {
        self.lock().spent.contains(y)
    }

    /// Run `call` unless a fault is queued for it
    fn call<T>(
        &self,
        call: MintCall,
        handler: impl FnOnce(&mut MintState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut state = self.lock();

        if state.offline {
            return Err(Error::TransportFailure("test mint offline".to_string()));
        }

        let fault = state.faults.get_mut(&call).and_then(|q| q.pop_front());

        match fault {
            None => handler(&mut *state),
            Some(Fault::Unreachable) => Err(Error::TransportFailure(format!(
                "{call:?} request dropped"
            ))),
            Some(Fault::Reject(msg)) => Err(Error::ProtocolError(msg)),
            Some(Fault::ResponseLost) => {
                handler(&mut *state)?;
                tracing::debug!("Test mint dropping {:?} response", call);
                Err(Error::Timeout)
            }
        }
    }

    fn mint_quote_response(id: &str, quote: &MintQuoteRecord) -> MintQuoteBolt11Response {
        MintQuoteBolt11Response {
            quote: id.to_string(),
            request: quote.request.clone(),
            amount: quote.amount,
            unit: Some(quote.unit.clone()),
            state: quote.state,
            expiry: Some(quote.expiry),
        }
    }

    fn melt_quote_response(
        id: &str,
        quote: &MeltQuoteRecord,
        change: Option<Vec<BlindSignature>>,
    ) -> MeltQuoteBolt11Response {
        MeltQuoteBolt11Response {
            quote: id.to_string(),
            amount: quote.amount,
            fee_reserve: quote.fee_reserve,
            state: quote.state,
            expiry: quote.expiry,
            payment_preimage: quote.payment_preimage.clone(),
            change,
        }
    }
}

impl MintState {
    fn keyset(&self, id: &Id) -> Result<&MintKeyset, Error> {
        self.keysets
            .iter()
            .find(|k| &k.info.id == id)
            .ok_or_else(|| reject(format!("unknown keyset {id}")))
    }

    fn input_fees(&self) -> HashMap<Id, u64> {
        self.keysets
            .iter()
            .map(|k| (k.info.id, k.info.input_fee_ppk))
            .collect()
    }

    /// Check the inputs can be spent and return their Ys, value and fee
    fn verify_inputs(&self, inputs: &[Proof]) -> Result<(Vec<PublicKey>, Amount, Amount), Error> {
        if inputs.is_empty() {
            return Err(reject("no inputs"));
        }

        let mut ys = Vec::with_capacity(inputs.len());

        for proof in inputs {
            let keyset = self.keyset(&proof.keyset_id)?;
            if keyset.info.unit != self.unit {
                return Err(reject("input unit mismatch"));
            }

            let key = keyset
                .secret_keys
                .get(&proof.amount)
                .ok_or_else(|| reject(format!("no key for amount {}", proof.amount)))?;
            verify_message(key, proof.c, proof.secret.as_bytes())
                .map_err(|e| reject(format!("invalid proof: {e}")))?;
            proof
                .verify_spending_conditions()
                .map_err(|e| reject(format!("spending conditions not met: {e}")))?;

            let y = proof.y().map_err(|e| reject(e.to_string()))?;
            if self.spent.contains(&y) {
                return Err(reject("token already spent"));
            }
            if self.pending.contains(&y) {
                return Err(reject("token pending"));
            }
            if ys.contains(&y) {
                return Err(reject("duplicate inputs"));
            }
            ys.push(y);
        }

        let total = Amount::try_sum(inputs.iter().map(|p| p.amount))
            .map_err(|e| reject(e.to_string()))?;
        let fee = calculate_fee(&inputs.count_by_keyset(), &self.input_fees())?;

        Ok((ys, total, fee))
    }

    /// Check every output can be signed before signing any
    fn verify_outputs(&self, outputs: &[BlindedMessage]) -> Result<(), Error> {
        let mut seen = HashSet::new();

        for output in outputs {
            let keyset = self.keyset(&output.keyset_id)?;
            if !keyset.info.active {
                return Err(reject(format!("keyset {} is inactive", output.keyset_id)));
            }
            if self.signed.contains_key(&output.blinded_secret)
                || !seen.insert(output.blinded_secret)
            {
                return Err(reject("outputs already signed"));
            }
        }

        Ok(())
    }

    fn sign(&mut self, output: &BlindedMessage, dleq: bool) -> Result<BlindSignature, Error> {
        let keyset = self.keyset(&output.keyset_id)?;
        let key = keyset
            .secret_keys
            .get(&output.amount)
            .ok_or_else(|| reject(format!("no key for amount {}", output.amount)))?;

        let c = sign_message(key, &output.blinded_secret).map_err(|e| reject(e.to_string()))?;
        let dleq = if dleq {
            Some(
                BlindSignatureDleq::new(key, &output.blinded_secret, &c)
                    .map_err(|e| reject(e.to_string()))?,
            )
        } else {
            None
        };

        let signature = BlindSignature {
            amount: output.amount,
            keyset_id: keyset.info.id,
            c,
            dleq,
        };

        self.signed.insert(
            output.blinded_secret,
            (output.clone(), signature.clone()),
        );

        Ok(signature)
    }

    fn sign_outputs(&mut self, outputs: &[BlindedMessage]) -> Result<Vec<BlindSignature>, Error> {
        self.verify_outputs(outputs)?;

        let dleq = self.dleq;
        outputs.iter().map(|o| self.sign(o, dleq)).collect()
    }

    /// Sign `change` on a prefix of blank outputs, largest amount first
    fn sign_change(
        &mut self,
        outputs: &[BlindedMessage],
        change: Amount,
        dleq: bool,
    ) -> Result<Vec<BlindSignature>, Error> {
        let mut signatures = Vec::new();

        for (output, amount) in outputs.iter().zip(change.split()) {
            let mut output = output.clone();
            output.amount = amount;
            signatures.push(self.sign(&output, dleq)?);
        }

        Ok(signatures)
    }
}

fn parse_fake_invoice(request: &str) -> Result<Amount, Error> {
    request
        .strip_prefix("lnfake")
        .and_then(|rest| rest.split('n').next())
        .and_then(|amount| amount.parse::<u64>().ok())
        .map(Amount::from)
        .ok_or_else(|| reject("invalid payment request"))
}

/// Payment request the test mint can melt
pub fn create_fake_invoice(amount_sat: u64) -> String {
    format!("lnfake{amount_sat}n{}", random_hex_32())
}

/// Fee reserve the test mint asks for a payment of `amount`
pub fn fee_reserve_for(amount: Amount) -> Amount {
    Amount::from((u64::from(amount) / 100).max(2))
}

/// Connection to a [`TestMint`] in the same process
#[derive(Debug, Clone)]
pub struct DirectMintConnection {
    mint: Arc<TestMint>,
}

impl DirectMintConnection {
    /// Create new [`DirectMintConnection`]
    pub fn new(mint: Arc<TestMint>) -> Self {
        Self { mint }
    }
}

#[async_trait]
impl MintConnector for DirectMintConnection {
    async fn get_mint_keys(&self) -> Result<Vec<KeySet>, Error> {
        self.mint.call(MintCall::Keys, |state| {
            Ok(state
                .keysets
                .iter()
                .filter(|k| k.info.active)
                .map(MintKeyset::keyset)
                .collect())
        })
    }

    async fn get_mint_keyset(&self, keyset_id: Id) -> Result<KeySet, Error> {
        self.mint
            .call(MintCall::Keys, |state| Ok(state.keyset(&keyset_id)?.keyset()))
    }

    async fn get_mint_keysets(&self) -> Result<KeysetResponse, Error> {
        self.mint.call(MintCall::Keys, |state| {
            Ok(KeysetResponse {
                keysets: state.keysets.iter().map(|k| k.info.clone()).collect(),
            })
        })
    }

    async fn post_mint_quote(
        &self,
        request: MintQuoteBolt11Request,
    ) -> Result<MintQuoteBolt11Response, Error> {
        self.mint.call(MintCall::MintQuote, |state| {
            if request.unit != state.unit {
                return Err(reject(format!("unsupported unit {}", request.unit)));
            }

            let id = random_hex_32();
            let quote = MintQuoteRecord {
                amount: request.amount,
                unit: request.unit,
                request: create_fake_invoice(request.amount.map(u64::from).unwrap_or_default()),
                state: MintQuoteState::Unpaid,
                expiry: unix_time() + QUOTE_TTL,
            };
            let response = TestMint::mint_quote_response(&id, &quote);
            state.mint_quotes.insert(id, quote);

            Ok(response)
        })
    }

    async fn get_mint_quote_status(
        &self,
        quote_id: &str,
    ) -> Result<MintQuoteBolt11Response, Error> {
        self.mint.call(MintCall::MintQuote, |state| {
            state
                .mint_quotes
                .get(quote_id)
                .map(|q| TestMint::mint_quote_response(quote_id, q))
                .ok_or_else(|| reject("unknown quote"))
        })
    }

    async fn post_mint(&self, request: MintRequest) -> Result<MintResponse, Error> {
        self.mint.call(MintCall::Mint, |state| {
            let quote = state
                .mint_quotes
                .get(&request.quote)
                .ok_or_else(|| reject("unknown quote"))?;

            match quote.state {
                MintQuoteState::Paid => (),
                MintQuoteState::Unpaid => return Err(reject("quote not paid")),
                MintQuoteState::Issued => return Err(reject("quote already issued")),
            }

            let quote_amount = quote
                .amount
                .ok_or_else(|| reject("quote amount undefined"))?;
            let requested = Amount::try_sum(request.outputs.iter().map(|o| o.amount))
                .map_err(|e| reject(e.to_string()))?;
            if requested != quote_amount {
                return Err(reject(format!(
                    "outputs {requested} do not match quote {quote_amount}"
                )));
            }

            let signatures = state.sign_outputs(&request.outputs)?;

            if let Some(quote) = state.mint_quotes.get_mut(&request.quote) {
                quote.state = MintQuoteState::Issued;
            }

            Ok(MintResponse { signatures })
        })
    }

    async fn post_melt_quote(
        &self,
        request: MeltQuoteBolt11Request,
    ) -> Result<MeltQuoteBolt11Response, Error> {
        self.mint.call(MintCall::MeltQuote, |state| {
            if request.unit != state.unit {
                return Err(reject(format!("unsupported unit {}", request.unit)));
            }

            let amount = parse_fake_invoice(&request.request)?;
            let id = random_hex_32();
            let quote = MeltQuoteRecord {
                amount,
                fee_reserve: fee_reserve_for(amount),
                state: MeltQuoteState::Unpaid,
                expiry: unix_time() + QUOTE_TTL,
                payment_preimage: None,
                in_flight: None,
            };
            let response = TestMint::melt_quote_response(&id, &quote, None);
            state.melt_quotes.insert(id, quote);

            Ok(response)
        })
    }

    async fn get_melt_quote_status(
        &self,
        quote_id: &str,
    ) -> Result<MeltQuoteBolt11Response, Error> {
        self.mint.call(MintCall::MeltQuote, |state| {
            state
                .melt_quotes
                .get(quote_id)
                .map(|q| TestMint::melt_quote_response(quote_id, q, None))
                .ok_or_else(|| reject("unknown quote"))
        })
    }

    async fn post_melt(&self, request: MeltRequest) -> Result<MeltQuoteBolt11Response, Error> {
        self.mint.call(MintCall::Melt, |state| {
            let (amount, fee_reserve) = {
                let quote = state
                    .melt_quotes
                    .get(&request.quote)
                    .ok_or_else(|| reject("unknown quote"))?;

                match quote.state {
                    MeltQuoteState::Unpaid => (),
                    MeltQuoteState::Pending => return Err(reject("quote pending")),
                    MeltQuoteState::Paid => return Err(reject("quote already paid")),
                }
                if quote.expiry < unix_time() {
                    return Err(reject("quote expired"));
                }

                (quote.amount, quote.fee_reserve)
            };

            let (ys, input_total, input_fee) = state.verify_inputs(&request.inputs)?;

            let required = amount
                .checked_add(fee_reserve)
                .and_then(|a| a.checked_add(input_fee))
                .ok_or(Error::AmountOverflow)?;
            if input_total < required {
                return Err(reject(format!(
                    "inputs {input_total} below required {required}"
                )));
            }

            let outputs = request.outputs.clone().unwrap_or_default();
            state.verify_outputs(&outputs)?;

            let max_change = input_total
                .checked_sub(input_fee)
                .and_then(|a| a.checked_sub(amount))
                .ok_or(Error::AmountOverflow)?;
            let dleq = state.dleq;

            match state.melt_outcome {
                MeltOutcome::Failed => {
                    let quote = state
                        .melt_quotes
                        .get(&request.quote)
                        .ok_or_else(|| reject("unknown quote"))?;
                    Ok(TestMint::melt_quote_response(&request.quote, quote, None))
                }
                MeltOutcome::Pending => {
                    state.pending.extend(ys.iter().copied());

                    let quote = state
                        .melt_quotes
                        .get_mut(&request.quote)
                        .ok_or_else(|| reject("unknown quote"))?;
                    quote.state = MeltQuoteState::Pending;
                    quote.in_flight = Some(InFlightMelt {
                        ys,
                        outputs,
                        max_change,
                    });

                    Ok(TestMint::melt_quote_response(&request.quote, quote, None))
                }
                MeltOutcome::Paid { fee_paid } => {
                    let fee_paid = fee_paid.min(fee_reserve);
                    let change = max_change.saturating_sub(fee_paid);

                    state.spent.extend(ys);
                    let signatures = state.sign_change(&outputs, change, dleq)?;

                    let quote = state
                        .melt_quotes
                        .get_mut(&request.quote)
                        .ok_or_else(|| reject("unknown quote"))?;
                    quote.state = MeltQuoteState::Paid;
                    quote.payment_preimage = Some(random_hex_32());

                    let change = (!signatures.is_empty()).then_some(signatures);

                    Ok(TestMint::melt_quote_response(&request.quote, quote, change))
                }
            }
        })
    }

    async fn post_swap(&self, request: SwapRequest) -> Result<SwapResponse, Error> {
        self.mint.call(MintCall::Swap, |state| {
            let (ys, input_total, fee) = state.verify_inputs(&request.inputs)?;

            let output_total = Amount::try_sum(request.outputs.iter().map(|o| o.amount))
                .map_err(|e| reject(e.to_string()))?;
            let expected = input_total
                .checked_sub(fee)
                .ok_or_else(|| reject("inputs do not cover the fee"))?;
            if output_total != expected {
                return Err(reject(format!(
                    "outputs {output_total} do not match inputs {input_total} minus fee {fee}"
                )));
            }

            let signatures = state.sign_outputs(&request.outputs)?;
            state.spent.extend(ys);

            Ok(SwapResponse { signatures })
        })
    }

    async fn post_check_state(
        &self,
        request: CheckStateRequest,
    ) -> Result<CheckStateResponse, Error> {
        self.mint.call(MintCall::CheckState, |state| {
            let states = request
                .ys
                .iter()
                .map(|y| ProofState {
                    y: *y,
                    state: if state.spent.contains(y) {
                        State::Spent
                    } else if state.pending.contains(y) {
                        State::Pending
                    } else {
                        State::Unspent
                    },
                    witness: None,
                })
                .collect();

            Ok(CheckStateResponse { states })
        })
    }

    async fn post_restore(&self, request: RestoreRequest) -> Result<RestoreResponse, Error> {
        self.mint.call(MintCall::Restore, |state| {
            let (outputs, signatures) = request
                .outputs
                .iter()
                .filter_map(|o| state.signed.get(&o.blinded_secret).cloned())
                .unzip();

            Ok(RestoreResponse {
                outputs,
                signatures,
            })
        })
    }
}

/// Install a tracing subscriber once per test binary
///
/// Honors `RUST_LOG`, defaulting to debug output for the wallet.
pub fn setup_tracing() {
    let default_filter = "debug";
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    // Ok if another test already installed it
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

/// Create a sat mint without input fees
pub fn create_test_mint() -> Arc<TestMint> {
    Arc::new(TestMint::new(CurrencyUnit::Sat, 0))
}

/// Create a sat mint charging `input_fee_ppk` per input
pub fn create_test_mint_with_fee(input_fee_ppk: u64) -> Arc<TestMint> {
    Arc::new(TestMint::new(CurrencyUnit::Sat, input_fee_ppk))
}

/// Wallet config for tests: no retries and short timeouts
pub fn test_wallet_config() -> WalletConfig {
    WalletConfig {
        retry: RetryPolicy::none(),
        read_timeout_ms: 2_000,
        mint_timeout_ms: 2_000,
        melt_timeout_ms: 2_000,
        swap_timeout_ms: 2_000,
        subscription_recv_timeout_ms: 2_000,
        subscription_poll_interval_ms: 50,
        ..Default::default()
    }
}

/// Create a sat wallet for `mint` with a fresh in-memory store
pub fn create_test_wallet_for_mint(mint: Arc<TestMint>) -> Result<Wallet> {
    create_test_wallet_with_db(mint, Arc::new(WalletMemoryDatabase::new()))
}

/// Create a sat wallet for `mint` on an existing store, with a fresh seed
pub fn create_test_wallet_with_db(mint: Arc<TestMint>, db: DynWalletDatabase) -> Result<Wallet> {
    create_test_wallet_with_seed(mint, db, test_seed()?)
}

/// Seed of a fresh random mnemonic
pub fn test_seed() -> Result<[u8; 64]> {
    Ok(mnemonic_to_seed(&generate_mnemonic()?, "")?)
}

/// Create a sat wallet for `mint` on an existing store with a given seed
pub fn create_test_wallet_with_seed(
    mint: Arc<TestMint>,
    db: DynWalletDatabase,
    seed: [u8; 64],
) -> Result<Wallet> {
    let wallet = WalletBuilder::new()
        .mint_url(TEST_MINT_URL.parse()?)
        .unit(CurrencyUnit::Sat)
        .localstore(db)
        .seed(seed)
        .client(Arc::new(DirectMintConnection::new(mint)))
        .config(test_wallet_config())
        .build()?;

    Ok(wallet)
}

/// Mint `amount` into `wallet`
pub async fn fund_wallet(wallet: &Wallet, mint: &TestMint, amount: u64) -> Result<Amount> {
    let quote = wallet.mint_quote(Some(Amount::from(amount)), None).await?;
    mint.pay_mint_quote(&quote.id)?;

    let proofs = wallet
        .mint(&quote.id, SplitTarget::default(), None)
        .await?;

    Ok(proofs.total_amount()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_invoice_amount() {
        let invoice = create_fake_invoice(1_500);
        assert_eq!(parse_fake_invoice(&invoice).unwrap(), Amount::from(1_500));
        assert!(parse_fake_invoice("lnbc1").is_err());
    }

    #[test]
    fn test_rotation_deactivates_old_keyset() {
        let mint = TestMint::new(CurrencyUnit::Sat, 0);
        let first = mint.active_keyset_id().unwrap();

        let second = mint.rotate_keyset(100);

        assert_ne!(first, second);
        assert_eq!(mint.active_keyset_id(), Some(second));
    }
}
