use anchor_lang::prelude::*;
use anchor_lang::solana_program::keccak;
use anchor_lang::solana_program::secp256k1_recover::secp256k1_recover;
use anchor_lang::system_program;
use anchor_spl::associated_token::AssociatedToken;
use anchor_spl::token::{self, Mint, Token, TokenAccount, Transfer};
use pyth_solana_receiver_sdk::price_update::{get_feed_id_from_hex, PriceUpdateV2};

declare_id!("DyfRWrvcJj7DCfC7btAmrrUW7vuM7YZ6r1nuxGRExbM8");

// =====================================================
// CONSTANTS
// =====================================================

// Pyth SOL/USD feed id (pull oracle)
pub const SOL_USD_FEED_ID: &str =
    "0xef0d8b6fda2ceba41da15d4095d1da392a0d2f8ed0c6c7bc0f4cfac8c280b56d";

/// Maximum accepted oracle price age in seconds.
pub const MAX_PRICE_AGE_SECS: u64 = 3600;

/// Internal token accounting unit: 10^18 (canonical cross-chain granularity).
pub const TOKEN_UNIT: u128 = 1_000_000_000_000_000_000;

/// Denominator for TGE and referral bonus ratios.
pub const PERMILLE_DENOM: u128 = 1000;

/// Prefix applied to message hashes before signature recovery.
pub const SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

// PDA seeds
pub const CONFIG_SEED: &[u8] = b"config";
pub const TREASURY_SEED: &[u8] = b"treasury";
pub const PURCHASE_SEED: &[u8] = b"purchase";
pub const ALLOCATION_SEED: &[u8] = b"allocation";
pub const REFERRAL_SEED: &[u8] = b"referral";
pub const USED_SIG_SEED: &[u8] = b"used_sig";

#[error_code]
pub enum SaleError {
    #[msg("Arithmetic overflow")]
    Overflow,
    #[msg("Invalid admin")]
    InvalidAdmin,
    #[msg("Phase boundaries out of order")]
    InvalidPhaseOrder,
    #[msg("Sale schedule can no longer be changed")]
    SaleAlreadyStarted,
    #[msg("Invalid configuration value")]
    InvalidConfigValue,
    #[msg("TGE already reached")]
    TgeAlreadyReached,
    #[msg("Sale not started")]
    SaleNotStarted,
    #[msg("Sale has ended")]
    SaleEnded,
    #[msg("Sale has not ended")]
    SaleNotEnded,
    #[msg("Sale is paused")]
    SalePaused,
    #[msg("Whitelist phase requires a signed purchase authorization")]
    WhitelistPurchaseRequired,
    #[msg("Whitelist phase is over")]
    WhitelistClosed,
    #[msg("Invalid amount")]
    InvalidAmount,
    #[msg("Zero tokens calculated")]
    ZeroTokens,
    #[msg("Unsupported payment mint")]
    InvalidPaymentMint,
    #[msg("Wrong sale token mint")]
    InvalidSaleMint,
    #[msg("Invalid price")]
    InvalidPrice,
    #[msg("Invalid signature")]
    InvalidSignature,
    #[msg("Signature hash does not match signature")]
    InvalidSignatureHash,
    #[msg("Authorization has expired")]
    SignatureExpired,
    #[msg("Authorization already used")]
    SignatureAlreadyUsed,
    #[msg("Invalid vesting category")]
    InvalidCategory,
    #[msg("Category cap exceeded")]
    CategoryCapExceeded,
    #[msg("Allocation already exists for this category")]
    AlreadyAllocated,
    #[msg("TGE timestamp not set")]
    TgeNotSet,
    #[msg("TGE not reached yet")]
    TgeNotReached,
    #[msg("No tokens to claim")]
    NothingToClaim,
    #[msg("Invalid referrer address")]
    InvalidReferrer,
    #[msg("Cannot refer yourself")]
    CannotReferSelf,
    #[msg("Already registered with a referrer")]
    AlreadyHasReferrer,
    #[msg("Invalid PDA derivation")]
    InvalidPda,
    #[msg("Insufficient withdrawable vault balance")]
    InsufficientVaultBalance,
}

#[program]
pub mod presale_vesting {
    use super::*;

    // =====================================================
    // INITIALIZATION & ADMIN
    // =====================================================

    /// Create the sale config, treasury-owned vault and pull the sale-token
    /// inventory into custody.
    pub fn initialize(ctx: Context<Initialize>, params: InitializeParams) -> Result<()> {
        validate_schedule(&params.schedule)?;
        require!(params.seconds_per_month > 0, SaleError::InvalidConfigValue);
        require!(
            params.referral_bonus_permille as u128 <= PERMILLE_DENOM,
            SaleError::InvalidConfigValue
        );
        for vc in params.vesting_configs.iter() {
            require!(
                vc.tge_permille as u128 <= PERMILLE_DENOM,
                SaleError::InvalidConfigValue
            );
        }
        require!(
            ctx.accounts.sale_mint.decimals <= 18,
            SaleError::InvalidConfigValue
        );

        let config = &mut ctx.accounts.config;
        config.admin = ctx.accounts.admin.key();
        config.sale_mint = ctx.accounts.sale_mint.key();
        config.usdt_mint = ctx.accounts.usdt_mint.key();
        config.usdc_mint = ctx.accounts.usdc_mint.key();
        config.bump = ctx.bumps.config;
        config.treasury_bump = ctx.bumps.treasury;
        config.schedule = params.schedule;
        config.tge_timestamp = 0;
        config.seconds_per_month = params.seconds_per_month;
        config.referral_enabled = params.referral_enabled;
        config.referral_bonus_permille = params.referral_bonus_permille;
        config.backend_signer = params.backend_signer;
        config.distribution_signer = params.distribution_signer;
        config.paused = false;
        config.category_caps = params.category_caps;
        config.category_allocated = [0; VestingCategory::COUNT];
        config.vesting_configs = params.vesting_configs;
        config.tokens_sold = 0;
        config.cross_chain_sold = 0;
        config.usd_raised_micro = 0;
        config.total_outstanding = 0;
        config.referral_bonus_issued = 0;

        // Move the sale inventory into the program vault
        if params.vault_deposit > 0 {
            let cpi_ctx = CpiContext::new(
                ctx.accounts.token_program.to_account_info(),
                Transfer {
                    from: ctx.accounts.sale_ata_for_admin.to_account_info(),
                    to: ctx.accounts.sale_vault.to_account_info(),
                    authority: ctx.accounts.admin.to_account_info(),
                },
            );
            token::transfer(cpi_ctx, params.vault_deposit)?;
        }

        emit!(SaleInitialized {
            admin: config.admin,
            sale_mint: config.sale_mint,
            presale_start: config.schedule.presale_start,
            public_end: config.schedule.public_end,
        });

        msg!(
            "Sale initialized: presale {}..{}, public {}..{}",
            config.schedule.presale_start,
            config.schedule.presale_end,
            config.schedule.public_start,
            config.schedule.public_end
        );
        Ok(())
    }

    /// Replace the sale schedule. Rejected once the presale window has opened.
    pub fn configure_sale(ctx: Context<AdminUpdate>, schedule: SaleSchedule) -> Result<()> {
        let clock = Clock::get()?;
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(
            clock.unix_timestamp < config.schedule.presale_start,
            SaleError::SaleAlreadyStarted
        );
        validate_schedule(&schedule)?;

        config.schedule = schedule;

        emit!(SaleConfigured {
            presale_start: schedule.presale_start,
            presale_end: schedule.presale_end,
            public_start: schedule.public_start,
            public_end: schedule.public_end,
        });
        Ok(())
    }

    /// Set or move the TGE timestamp. Only allowed while TGE has not been
    /// reached, and never into the past.
    pub fn set_tge_timestamp(ctx: Context<AdminUpdate>, tge_timestamp: i64) -> Result<()> {
        let clock = Clock::get()?;
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(tge_timestamp > 0, SaleError::InvalidConfigValue);
        require!(
            config.tge_timestamp == 0 || clock.unix_timestamp < config.tge_timestamp,
            SaleError::TgeAlreadyReached
        );
        require!(
            tge_timestamp >= clock.unix_timestamp,
            SaleError::InvalidConfigValue
        );

        config.tge_timestamp = tge_timestamp;
        emit!(TgeScheduled { tge_timestamp });
        msg!("TGE scheduled at {}", tge_timestamp);
        Ok(())
    }

    pub fn set_referral_config(
        ctx: Context<AdminUpdate>,
        enabled: bool,
        bonus_permille: u16,
    ) -> Result<()> {
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(
            bonus_permille as u128 <= PERMILLE_DENOM,
            SaleError::InvalidConfigValue
        );

        config.referral_enabled = enabled;
        config.referral_bonus_permille = bonus_permille;
        msg!("Referral config: enabled={} bonus={}", enabled, bonus_permille);
        Ok(())
    }

    /// Rotate the backend key that signs whitelist purchase capabilities.
    pub fn set_backend_signer(ctx: Context<AdminUpdate>, signer: [u8; 20]) -> Result<()> {
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(signer != [0u8; 20], SaleError::InvalidConfigValue);
        config.backend_signer = signer;
        Ok(())
    }

    /// Rotate the key that signs cross-chain distribution proofs.
    pub fn set_distribution_signer(ctx: Context<AdminUpdate>, signer: [u8; 20]) -> Result<()> {
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(signer != [0u8; 20], SaleError::InvalidConfigValue);
        config.distribution_signer = signer;
        Ok(())
    }

    pub fn set_paused(ctx: Context<AdminUpdate>, paused: bool) -> Result<()> {
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        config.paused = paused;
        emit!(SalePauseSet { paused });
        msg!("Sale paused = {}", paused);
        Ok(())
    }

    // =====================================================
    // REFERRALS
    // =====================================================

    /// Record the caller's referrer. First referrer wins and the link is
    /// permanent. Also creates the referrer's ledger so later purchases can
    /// accrue volume and bonus to it.
    pub fn register_referrer(ctx: Context<RegisterReferrer>, referrer: Pubkey) -> Result<()> {
        require!(!ctx.accounts.config.paused, SaleError::SalePaused);
        require!(referrer != Pubkey::default(), SaleError::InvalidReferrer);
        require!(
            referrer != ctx.accounts.user.key(),
            SaleError::CannotReferSelf
        );

        let purchase = &mut ctx.accounts.user_purchase;
        require!(
            purchase.referrer == Pubkey::default(),
            SaleError::AlreadyHasReferrer
        );
        if purchase.buyer == Pubkey::default() {
            purchase.buyer = ctx.accounts.user.key();
        }
        purchase.referrer = referrer;

        let info = &mut ctx.accounts.referral_info;
        if info.referrer == Pubkey::default() {
            info.referrer = referrer;
            info.bump = ctx.bumps.referral_info;
        }
        info.total_referred = info
            .total_referred
            .checked_add(1)
            .ok_or(SaleError::Overflow)?;

        emit!(ReferralRecorded {
            user: ctx.accounts.user.key(),
            referrer,
        });
        msg!("Referrer {} recorded for {}", referrer, ctx.accounts.user.key());
        Ok(())
    }

    // =====================================================
    // PURCHASES
    // =====================================================

    /// Whitelist-phase purchase paid in USDT/USDC, authorized by a
    /// backend-signed single-use capability over (buyer, amount, nonce,
    /// program id).
    pub fn buy_with_stablecoin_whitelist(
        ctx: Context<BuyWithStablecoinWhitelist>,
        usd_amount: u64,
        nonce: u64,
        signature: [u8; 65],
        sig_hash: [u8; 32],
    ) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;

        {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            match sale_phase(&config.schedule, now) {
                SalePhase::PresaleWhitelist => {}
                SalePhase::NotStarted => return err!(SaleError::SaleNotStarted),
                SalePhase::PublicSale => return err!(SaleError::WhitelistClosed),
                SalePhase::Ended => return err!(SaleError::SaleEnded),
            }
            require!(usd_amount > 0, SaleError::InvalidAmount);
            require_payment_mint(config, &ctx.accounts.payment_mint.key())?;

            let digest = purchase_digest(
                &ctx.accounts.buyer.key(),
                usd_amount,
                nonce,
                ctx.program_id,
            );
            verify_capability(&digest, &signature, &config.backend_signer)?;
        }

        // Burn the capability before any ledger write
        ctx.accounts.used_signature.bump = ctx.bumps.used_signature;
        consume_signature(
            &mut ctx.accounts.used_signature,
            &signature,
            &sig_hash,
            ctx.accounts.buyer.key(),
            now,
        )?;

        let allocation_bump = ctx.bumps.sale_allocation;
        process_purchase(
            &mut ctx.accounts.config,
            &mut ctx.accounts.user_purchase,
            &mut ctx.accounts.sale_allocation,
            allocation_bump,
            &ctx.accounts.referrer_info,
            ctx.program_id,
            ctx.accounts.buyer.key(),
            ctx.accounts.payment_mint.key(),
            usd_amount,
            usd_amount,
            VestingCategory::Presale,
            now,
        )?;

        // Payment custody last
        let cpi_ctx = CpiContext::new(
            ctx.accounts.token_program.to_account_info(),
            Transfer {
                from: ctx.accounts.payment_ata_for_buyer.to_account_info(),
                to: ctx.accounts.payment_ata_for_treasury.to_account_info(),
                authority: ctx.accounts.buyer.to_account_info(),
            },
        );
        token::transfer(cpi_ctx, usd_amount)?;

        Ok(())
    }

    /// Public-phase purchase paid in USDT/USDC at the current step rate.
    pub fn buy_with_stablecoin(ctx: Context<BuyWithStablecoin>, usd_amount: u64) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;

        {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            match sale_phase(&config.schedule, now) {
                SalePhase::PublicSale => {}
                SalePhase::NotStarted => return err!(SaleError::SaleNotStarted),
                SalePhase::PresaleWhitelist => {
                    return err!(SaleError::WhitelistPurchaseRequired)
                }
                SalePhase::Ended => return err!(SaleError::SaleEnded),
            }
            require!(usd_amount > 0, SaleError::InvalidAmount);
            require_payment_mint(config, &ctx.accounts.payment_mint.key())?;
        }

        let allocation_bump = ctx.bumps.sale_allocation;
        process_purchase(
            &mut ctx.accounts.config,
            &mut ctx.accounts.user_purchase,
            &mut ctx.accounts.sale_allocation,
            allocation_bump,
            &ctx.accounts.referrer_info,
            ctx.program_id,
            ctx.accounts.buyer.key(),
            ctx.accounts.payment_mint.key(),
            usd_amount,
            usd_amount,
            VestingCategory::PublicSale,
            now,
        )?;

        let cpi_ctx = CpiContext::new(
            ctx.accounts.token_program.to_account_info(),
            Transfer {
                from: ctx.accounts.payment_ata_for_buyer.to_account_info(),
                to: ctx.accounts.payment_ata_for_treasury.to_account_info(),
                authority: ctx.accounts.buyer.to_account_info(),
            },
        );
        token::transfer(cpi_ctx, usd_amount)?;

        Ok(())
    }

    /// Whitelist-phase purchase paid in SOL, converted through the Pyth
    /// SOL/USD feed. The capability binds the lamport amount.
    pub fn buy_with_sol_whitelist(
        ctx: Context<BuyWithSolWhitelist>,
        lamports: u64,
        nonce: u64,
        signature: [u8; 65],
        sig_hash: [u8; 32],
    ) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;

        {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            match sale_phase(&config.schedule, now) {
                SalePhase::PresaleWhitelist => {}
                SalePhase::NotStarted => return err!(SaleError::SaleNotStarted),
                SalePhase::PublicSale => return err!(SaleError::WhitelistClosed),
                SalePhase::Ended => return err!(SaleError::SaleEnded),
            }
            require!(lamports > 0, SaleError::InvalidAmount);

            let digest = purchase_digest(
                &ctx.accounts.buyer.key(),
                lamports,
                nonce,
                ctx.program_id,
            );
            verify_capability(&digest, &signature, &config.backend_signer)?;
        }

        let usd_micro = oracle_usd_micro(&ctx.accounts.pyth_sol_usd_price, lamports)?;

        ctx.accounts.used_signature.bump = ctx.bumps.used_signature;
        consume_signature(
            &mut ctx.accounts.used_signature,
            &signature,
            &sig_hash,
            ctx.accounts.buyer.key(),
            now,
        )?;

        let allocation_bump = ctx.bumps.sale_allocation;
        process_purchase(
            &mut ctx.accounts.config,
            &mut ctx.accounts.user_purchase,
            &mut ctx.accounts.sale_allocation,
            allocation_bump,
            &ctx.accounts.referrer_info,
            ctx.program_id,
            ctx.accounts.buyer.key(),
            Pubkey::default(),
            lamports,
            usd_micro,
            VestingCategory::Presale,
            now,
        )?;

        system_program::transfer(
            CpiContext::new(
                ctx.accounts.system_program.to_account_info(),
                system_program::Transfer {
                    from: ctx.accounts.buyer.to_account_info(),
                    to: ctx.accounts.treasury.to_account_info(),
                },
            ),
            lamports,
        )?;

        Ok(())
    }

    /// Public-phase purchase paid in SOL.
    pub fn buy_with_sol(ctx: Context<BuyWithSol>, lamports: u64) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;

        {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            match sale_phase(&config.schedule, now) {
                SalePhase::PublicSale => {}
                SalePhase::NotStarted => return err!(SaleError::SaleNotStarted),
                SalePhase::PresaleWhitelist => {
                    return err!(SaleError::WhitelistPurchaseRequired)
                }
                SalePhase::Ended => return err!(SaleError::SaleEnded),
            }
            require!(lamports > 0, SaleError::InvalidAmount);
        }

        let usd_micro = oracle_usd_micro(&ctx.accounts.pyth_sol_usd_price, lamports)?;

        let allocation_bump = ctx.bumps.sale_allocation;
        process_purchase(
            &mut ctx.accounts.config,
            &mut ctx.accounts.user_purchase,
            &mut ctx.accounts.sale_allocation,
            allocation_bump,
            &ctx.accounts.referrer_info,
            ctx.program_id,
            ctx.accounts.buyer.key(),
            Pubkey::default(),
            lamports,
            usd_micro,
            VestingCategory::PublicSale,
            now,
        )?;

        system_program::transfer(
            CpiContext::new(
                ctx.accounts.system_program.to_account_info(),
                system_program::Transfer {
                    from: ctx.accounts.buyer.to_account_info(),
                    to: ctx.accounts.treasury.to_account_info(),
                },
            ),
            lamports,
        )?;

        Ok(())
    }

    // =====================================================
    // CROSS-CHAIN DISTRIBUTION
    // =====================================================

    /// Credit tokens bought on another chain. The proof binds (claimant,
    /// amount, nonce, program id, chain id, sale-category flag, referrer,
    /// expiry) and must be signed by the distribution key; each proof is
    /// single-use.
    #[allow(clippy::too_many_arguments)]
    pub fn distribute_cross_chain(
        ctx: Context<DistributeCrossChain>,
        amount: u128,
        nonce: u64,
        chain_id: u64,
        category_flag: u8,
        referrer: Pubkey,
        expiry: i64,
        signature: [u8; 65],
        sig_hash: [u8; 32],
    ) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;
        let claimant = ctx.accounts.claimant.key();

        {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            require!(amount > 0, SaleError::InvalidAmount);
            require!(category_flag <= 1, SaleError::InvalidCategory);
            require!(now <= expiry, SaleError::SignatureExpired);

            let digest = distribution_digest(
                &claimant,
                amount,
                nonce,
                ctx.program_id,
                chain_id,
                category_flag,
                &referrer,
                expiry,
            );
            verify_capability(&digest, &signature, &config.distribution_signer)?;
        }

        ctx.accounts.used_signature.bump = ctx.bumps.used_signature;
        consume_signature(
            &mut ctx.accounts.used_signature,
            &signature,
            &sig_hash,
            claimant,
            now,
        )?;

        let category = VestingCategory::from_index(category_flag)?;
        let config = &mut ctx.accounts.config;
        grant_category(config, category, amount)?;

        let allocation = &mut ctx.accounts.sale_allocation;
        if allocation.user == Pubkey::default() {
            allocation.user = claimant;
            allocation.category = category_flag;
            allocation.allocation_time = now;
            allocation.bump = ctx.bumps.sale_allocation;
        }
        allocation.total_allocated = allocation
            .total_allocated
            .checked_add(amount)
            .ok_or(SaleError::Overflow)?;

        let purchase = &mut ctx.accounts.user_purchase;
        if purchase.buyer == Pubkey::default() {
            purchase.buyer = claimant;
        }
        purchase.tokens_purchased = purchase
            .tokens_purchased
            .checked_add(amount)
            .ok_or(SaleError::Overflow)?;

        if referrer != Pubkey::default()
            && referrer != claimant
            && purchase.referrer == Pubkey::default()
        {
            purchase.referrer = referrer;
            emit!(ReferralRecorded {
                user: claimant,
                referrer,
            });
        }
        let mut referral_bonus = 0u128;
        if config.referral_enabled && purchase.referrer != Pubkey::default() {
            referral_bonus = credit_referral(
                config,
                purchase.referrer,
                &ctx.accounts.referrer_info,
                ctx.program_id,
                0,
                amount,
            )?;
        }

        config.tokens_sold = config
            .tokens_sold
            .checked_add(amount)
            .ok_or(SaleError::Overflow)?;
        config.cross_chain_sold = config
            .cross_chain_sold
            .checked_add(amount)
            .ok_or(SaleError::Overflow)?;
        config.total_outstanding = config
            .total_outstanding
            .checked_add(amount)
            .ok_or(SaleError::Overflow)?;

        emit!(TokensDistributed {
            claimant,
            category: category_flag,
            amount,
            chain_id,
            referral_bonus,
        });
        msg!(
            "Cross-chain distribution: {} units to {} from chain {}",
            amount,
            claimant,
            chain_id
        );
        Ok(())
    }

    // =====================================================
    // ALLOCATION & VESTING LEDGER
    // =====================================================

    /// Grant a one-shot allocation in a vesting category (admin only). A
    /// second allocation for the same (recipient, category) is rejected.
    pub fn allocate_tokens(ctx: Context<AllocateTokens>, category: u8, amount: u128) -> Result<()> {
        let clock = Clock::get()?;
        let config = &mut ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(amount > 0, SaleError::InvalidAmount);
        let cat = VestingCategory::from_index(category)?;

        let allocation = &mut ctx.accounts.allocation;
        require!(allocation.total_allocated == 0, SaleError::AlreadyAllocated);

        grant_category(config, cat, amount)?;

        allocation.user = ctx.accounts.recipient.key();
        allocation.category = category;
        allocation.total_allocated = amount;
        allocation.claimed = 0;
        allocation.allocation_time = clock.unix_timestamp;
        allocation.bump = ctx.bumps.allocation;

        config.total_outstanding = config
            .total_outstanding
            .checked_add(amount)
            .ok_or(SaleError::Overflow)?;

        emit!(TokensAllocated {
            recipient: allocation.user,
            category,
            amount,
            category_total: config.category_allocated[cat as usize],
        });
        msg!(
            "Allocated {} units to {} in category {}",
            amount,
            allocation.user,
            category
        );
        Ok(())
    }

    /// Release the unclaimed share of the TGE unlock for one category.
    pub fn claim_tge_tokens(ctx: Context<ClaimTokens>, category: u8) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;
        let cat = VestingCategory::from_index(category)?;

        let claimable = {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            require!(config.tge_timestamp > 0, SaleError::TgeNotSet);
            require!(now >= config.tge_timestamp, SaleError::TgeNotReached);

            let vc = config.vesting_configs[cat as usize];
            let allocation = &ctx.accounts.allocation;
            let tge = tge_amount(allocation.total_allocated, vc.tge_permille)?;
            tge.saturating_sub(allocation.claimed)
        };

        let decimals = ctx.accounts.sale_mint.decimals;
        let user = ctx.accounts.user.key();
        settle_claim(
            &mut ctx.accounts.config,
            &mut ctx.accounts.allocation,
            &ctx.accounts.sale_vault,
            &ctx.accounts.user_sale_ata,
            &ctx.accounts.treasury,
            &ctx.accounts.token_program,
            decimals,
            user,
            category,
            claimable,
        )
    }

    /// Release everything vested up to now (TGE + cliff + linear) that has
    /// not been claimed yet for one category.
    pub fn claim_vested_tokens(ctx: Context<ClaimTokens>, category: u8) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;
        let cat = VestingCategory::from_index(category)?;

        let claimable = {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            require!(config.tge_timestamp > 0, SaleError::TgeNotSet);
            require!(now >= config.tge_timestamp, SaleError::TgeNotReached);

            let vc = config.vesting_configs[cat as usize];
            let allocation = &ctx.accounts.allocation;
            let vested = vested_amount(
                allocation.total_allocated,
                &vc,
                config.tge_timestamp,
                config.seconds_per_month,
                now,
            )?;
            vested.saturating_sub(allocation.claimed)
        };

        let decimals = ctx.accounts.sale_mint.decimals;
        let user = ctx.accounts.user.key();
        settle_claim(
            &mut ctx.accounts.config,
            &mut ctx.accounts.allocation,
            &ctx.accounts.sale_vault,
            &ctx.accounts.user_sale_ata,
            &ctx.accounts.treasury,
            &ctx.accounts.token_program,
            decimals,
            user,
            category,
            claimable,
        )
    }

    /// Claim accrued referral bonuses (deferred payout in the sale token,
    /// unlocked at TGE).
    pub fn claim_referral_bonus(ctx: Context<ClaimReferralBonus>) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;

        let claimable = {
            let config = &ctx.accounts.config;
            require!(!config.paused, SaleError::SalePaused);
            require!(config.tge_timestamp > 0, SaleError::TgeNotSet);
            require!(now >= config.tge_timestamp, SaleError::TgeNotReached);

            let info = &ctx.accounts.referral_info;
            info.bonus_earned.saturating_sub(info.bonus_claimed)
        };

        let (base, accounted) =
            payout_base_units(claimable, ctx.accounts.sale_mint.decimals)?;
        require!(base > 0, SaleError::NothingToClaim);

        let info = &mut ctx.accounts.referral_info;
        info.bonus_claimed = info
            .bonus_claimed
            .checked_add(accounted)
            .ok_or(SaleError::Overflow)?;

        let config = &mut ctx.accounts.config;
        config.total_outstanding = config
            .total_outstanding
            .checked_sub(accounted)
            .ok_or(SaleError::Overflow)?;
        let treasury_bump = config.treasury_bump;

        let treasury_seeds = &[TREASURY_SEED, &[treasury_bump]];
        let signer_seeds = &[&treasury_seeds[..]];
        let cpi_ctx = CpiContext::new_with_signer(
            ctx.accounts.token_program.to_account_info(),
            Transfer {
                from: ctx.accounts.sale_vault.to_account_info(),
                to: ctx.accounts.user_sale_ata.to_account_info(),
                authority: ctx.accounts.treasury.to_account_info(),
            },
            signer_seeds,
        );
        token::transfer(cpi_ctx, base)?;

        emit!(ReferralBonusClaimed {
            referrer: ctx.accounts.user.key(),
            amount_units: accounted,
            amount_base: base,
        });
        msg!("Referral bonus claimed: {} base units", base);
        Ok(())
    }

    /// Log the currently claimable amounts for an allocation (status view).
    pub fn get_claimable_amount(
        ctx: Context<GetClaimableAmount>,
        category: u8,
        owner: Pubkey,
    ) -> Result<()> {
        let clock = Clock::get()?;
        let now = clock.unix_timestamp;
        let cat = VestingCategory::from_index(category)?;
        let config = &ctx.accounts.config;
        let allocation = &ctx.accounts.allocation;

        let vc = config.vesting_configs[cat as usize];
        let vested = vested_amount(
            allocation.total_allocated,
            &vc,
            config.tge_timestamp,
            config.seconds_per_month,
            now,
        )?;
        let tge_reached = config.tge_timestamp > 0 && now >= config.tge_timestamp;
        let tge_claimable = if tge_reached {
            tge_amount(allocation.total_allocated, vc.tge_permille)?
                .saturating_sub(allocation.claimed)
        } else {
            0
        };

        msg!(
            "Claimable for {} category {}: tge={} vested={} (allocated={} claimed={})",
            owner,
            category,
            tge_claimable,
            vested.saturating_sub(allocation.claimed),
            allocation.total_allocated,
            allocation.claimed
        );
        Ok(())
    }

    // =====================================================
    // FUND CUSTODY & WITHDRAWAL
    // =====================================================

    /// Sweep one collected stablecoin balance to the operator. Only once the
    /// sale has ended.
    pub fn withdraw_funds(ctx: Context<WithdrawFunds>) -> Result<()> {
        let clock = Clock::get()?;
        let config = &ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(
            sale_phase(&config.schedule, clock.unix_timestamp) == SalePhase::Ended,
            SaleError::SaleNotEnded
        );
        require_payment_mint(config, &ctx.accounts.payment_mint.key())?;

        let amount = ctx.accounts.payment_ata_for_treasury.amount;
        require!(amount > 0, SaleError::NothingToClaim);

        let treasury_seeds = &[TREASURY_SEED, &[config.treasury_bump]];
        let signer_seeds = &[&treasury_seeds[..]];
        let cpi_ctx = CpiContext::new_with_signer(
            ctx.accounts.token_program.to_account_info(),
            Transfer {
                from: ctx.accounts.payment_ata_for_treasury.to_account_info(),
                to: ctx.accounts.payment_ata_for_admin.to_account_info(),
                authority: ctx.accounts.treasury.to_account_info(),
            },
            signer_seeds,
        );
        token::transfer(cpi_ctx, amount)?;

        emit!(FundsWithdrawn {
            currency: ctx.accounts.payment_mint.key(),
            amount,
        });
        msg!("Withdrew {} payment units", amount);
        Ok(())
    }

    /// Sweep collected SOL to the operator. Only once the sale has ended.
    pub fn withdraw_sol(ctx: Context<WithdrawSol>) -> Result<()> {
        let clock = Clock::get()?;
        let config = &ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(
            sale_phase(&config.schedule, clock.unix_timestamp) == SalePhase::Ended,
            SaleError::SaleNotEnded
        );

        let amount = ctx.accounts.treasury.lamports();
        require!(amount > 0, SaleError::NothingToClaim);

        let treasury_seeds = &[TREASURY_SEED, &[config.treasury_bump]];
        let signer_seeds = &[&treasury_seeds[..]];
        system_program::transfer(
            CpiContext::new_with_signer(
                ctx.accounts.system_program.to_account_info(),
                system_program::Transfer {
                    from: ctx.accounts.treasury.to_account_info(),
                    to: ctx.accounts.admin.to_account_info(),
                },
                signer_seeds,
            ),
            amount,
        )?;

        emit!(FundsWithdrawn {
            currency: Pubkey::default(),
            amount,
        });
        msg!("Withdrew {} lamports", amount);
        Ok(())
    }

    /// Pull unsold sale-token inventory out of the vault. The balance owed to
    /// allocation holders stays reserved.
    pub fn emergency_token_withdraw(
        ctx: Context<EmergencyTokenWithdraw>,
        amount: u64,
    ) -> Result<()> {
        let config = &ctx.accounts.config;
        require!(
            config.admin == ctx.accounts.admin.key(),
            SaleError::InvalidAdmin
        );
        require!(amount > 0, SaleError::InvalidAmount);

        let scale = unit_scale(ctx.accounts.sale_mint.decimals)?;
        let reserved_units = config
            .total_outstanding
            .checked_add(scale - 1)
            .ok_or(SaleError::Overflow)?
            / scale;
        let reserved: u64 = reserved_units
            .try_into()
            .map_err(|_| error!(SaleError::Overflow))?;
        let available = ctx
            .accounts
            .sale_vault
            .amount
            .checked_sub(reserved)
            .ok_or(SaleError::InsufficientVaultBalance)?;
        require!(amount <= available, SaleError::InsufficientVaultBalance);

        let treasury_seeds = &[TREASURY_SEED, &[config.treasury_bump]];
        let signer_seeds = &[&treasury_seeds[..]];
        let cpi_ctx = CpiContext::new_with_signer(
            ctx.accounts.token_program.to_account_info(),
            Transfer {
                from: ctx.accounts.sale_vault.to_account_info(),
                to: ctx.accounts.sale_ata_for_admin.to_account_info(),
                authority: ctx.accounts.treasury.to_account_info(),
            },
            signer_seeds,
        );
        token::transfer(cpi_ctx, amount)?;

        emit!(FundsWithdrawn {
            currency: ctx.accounts.sale_mint.key(),
            amount,
        });
        msg!("Withdrew {} unsold sale tokens", amount);
        Ok(())
    }
}

// =====================================================
// ENGINE MATH (pure, unit-tested)
// =====================================================

/// Derive the sale phase from the schedule and the current time. Evaluated
/// fresh on every instruction; nothing caches the result.
pub fn sale_phase(s: &SaleSchedule, now: i64) -> SalePhase {
    if now >= s.public_end {
        return SalePhase::Ended;
    }
    if now >= s.public_start {
        return SalePhase::PublicSale;
    }
    if now >= s.presale_end {
        // configured gap between the two windows
        return SalePhase::NotStarted;
    }
    if now >= s.presale_start {
        return SalePhase::PresaleWhitelist;
    }
    SalePhase::NotStarted
}

/// Current price in micro-USD per whole token. Fixed during the whitelist
/// window; a non-decreasing step function during the public window; zero
/// outside both.
pub fn current_rate(s: &SaleSchedule, now: i64) -> Result<u64> {
    match sale_phase(s, now) {
        SalePhase::PresaleWhitelist => Ok(s.presale_rate),
        SalePhase::PublicSale => {
            let steps = (now - s.public_start) / s.price_increase_interval;
            let raise = s
                .price_increase_amount
                .checked_mul(steps as u64)
                .ok_or(SaleError::Overflow)?;
            Ok(s
                .public_start_rate
                .checked_add(raise)
                .ok_or(SaleError::Overflow)?)
        }
        _ => Ok(0),
    }
}

/// tokens = usd * 10^18 / rate, floor division, no rounding adjustment.
pub fn tokens_for_usd(usd_micro: u64, rate: u64) -> Result<u128> {
    require!(rate > 0, SaleError::InvalidPrice);
    Ok((usd_micro as u128)
        .checked_mul(TOKEN_UNIT)
        .ok_or(SaleError::Overflow)?
        .checked_div(rate as u128)
        .ok_or(SaleError::Overflow)?)
}

pub fn tge_amount(total: u128, tge_permille: u16) -> Result<u128> {
    Ok(total
        .checked_mul(tge_permille as u128)
        .ok_or(SaleError::Overflow)?
        .checked_div(PERMILLE_DENOM)
        .ok_or(SaleError::Overflow)?)
}

pub fn bonus_amount(tokens: u128, bonus_permille: u16) -> Result<u128> {
    Ok(tokens
        .checked_mul(bonus_permille as u128)
        .ok_or(SaleError::Overflow)?
        .checked_div(PERMILLE_DENOM)
        .ok_or(SaleError::Overflow)?)
}

/// Total vested at `now` for one allocation. Month length is injected via
/// `seconds_per_month`; production passes calendar time, harnesses may
/// compress it.
pub fn vested_amount(
    total: u128,
    vc: &VestingConfig,
    tge_timestamp: i64,
    seconds_per_month: i64,
    now: i64,
) -> Result<u128> {
    if tge_timestamp == 0 || now < tge_timestamp {
        return Ok(0);
    }
    let tge = tge_amount(total, vc.tge_permille)?;
    if vc.vesting_months == 0 {
        return Ok(tge);
    }

    let cliff_seconds = (vc.cliff_months as i64)
        .checked_mul(seconds_per_month)
        .ok_or(SaleError::Overflow)?;
    let cliff_end = tge_timestamp
        .checked_add(cliff_seconds)
        .ok_or(SaleError::Overflow)?;
    if now < cliff_end {
        return Ok(tge);
    }

    let duration = (vc.vesting_months as i64)
        .checked_mul(seconds_per_month)
        .ok_or(SaleError::Overflow)?;
    let vesting_end = tge_timestamp
        .checked_add(duration)
        .ok_or(SaleError::Overflow)?;
    if now >= vesting_end {
        return Ok(total);
    }

    // linear since TGE over the whole vesting duration
    let elapsed = (now - tge_timestamp) as u128;
    let linear = total
        .checked_sub(tge)
        .ok_or(SaleError::Overflow)?
        .checked_mul(elapsed)
        .ok_or(SaleError::Overflow)?
        .checked_div(duration as u128)
        .ok_or(SaleError::Overflow)?;
    Ok(tge.checked_add(linear).ok_or(SaleError::Overflow)?)
}

pub fn unit_scale(mint_decimals: u8) -> Result<u128> {
    require!(mint_decimals <= 18, SaleError::InvalidConfigValue);
    Ok(10u128.pow((18 - mint_decimals) as u32))
}

/// Convert accounting units into transferable mint base units. Returns the
/// base amount and the accounting units it covers; dust below one base unit
/// stays claimable.
pub fn payout_base_units(units: u128, mint_decimals: u8) -> Result<(u64, u128)> {
    let scale = unit_scale(mint_decimals)?;
    let base = units / scale;
    let base_u64: u64 = base.try_into().map_err(|_| error!(SaleError::Overflow))?;
    Ok((base_u64, base.checked_mul(scale).ok_or(SaleError::Overflow)?))
}

pub fn lamports_to_usd_micro(lamports: u64, price: i64, exponent: i32) -> Result<u64> {
    require!(price > 0, SaleError::InvalidPrice);
    require!(exponent <= 0, SaleError::InvalidPrice);

    // usd_micro = lamports * price * 10^exponent / 10^9 * 10^6
    let value = (lamports as i128)
        .checked_mul(price as i128)
        .ok_or(SaleError::Overflow)?
        .checked_mul(1_000_000)
        .ok_or(SaleError::Overflow)?;
    let divisor = 10_i128
        .checked_pow((9 - exponent) as u32)
        .ok_or(SaleError::Overflow)?;
    let usd = value.checked_div(divisor).ok_or(SaleError::Overflow)?;
    u64::try_from(usd).map_err(|_| error!(SaleError::Overflow))
}

pub fn validate_schedule(s: &SaleSchedule) -> Result<()> {
    require!(s.presale_start < s.presale_end, SaleError::InvalidPhaseOrder);
    require!(s.presale_end <= s.public_start, SaleError::InvalidPhaseOrder);
    require!(s.public_start < s.public_end, SaleError::InvalidPhaseOrder);
    require!(s.presale_rate > 0, SaleError::InvalidConfigValue);
    require!(s.public_start_rate > 0, SaleError::InvalidConfigValue);
    require!(s.price_increase_interval > 0, SaleError::InvalidConfigValue);
    Ok(())
}

/// Check-then-increment a category's running total against its cap. Runs
/// before any external transfer on every granting path.
pub fn grant_category(config: &mut Config, category: VestingCategory, amount: u128) -> Result<()> {
    let idx = category as usize;
    let new_total = config.category_allocated[idx]
        .checked_add(amount)
        .ok_or(SaleError::Overflow)?;
    require!(
        new_total <= config.category_caps[idx],
        SaleError::CategoryCapExceeded
    );
    config.category_allocated[idx] = new_total;
    Ok(())
}

// =====================================================
// SIGNATURE AUTHORIZATION
// =====================================================

fn prefixed_digest(message_hash: &[u8; 32]) -> [u8; 32] {
    keccak::hashv(&[SIGNED_MESSAGE_PREFIX, message_hash]).to_bytes()
}

/// Digest for a whitelist purchase capability: (buyer, amount, nonce,
/// program id).
pub fn purchase_digest(buyer: &Pubkey, amount: u64, nonce: u64, program_id: &Pubkey) -> [u8; 32] {
    let message = keccak::hashv(&[
        buyer.as_ref(),
        &amount.to_le_bytes(),
        &nonce.to_le_bytes(),
        program_id.as_ref(),
    ]);
    prefixed_digest(&message.to_bytes())
}

/// Digest for a cross-chain distribution proof: additionally binds chain id,
/// the sale-category flag, the referrer and an expiry.
#[allow(clippy::too_many_arguments)]
pub fn distribution_digest(
    claimant: &Pubkey,
    amount: u128,
    nonce: u64,
    program_id: &Pubkey,
    chain_id: u64,
    category_flag: u8,
    referrer: &Pubkey,
    expiry: i64,
) -> [u8; 32] {
    let message = keccak::hashv(&[
        claimant.as_ref(),
        &amount.to_le_bytes(),
        &nonce.to_le_bytes(),
        program_id.as_ref(),
        &chain_id.to_le_bytes(),
        &[category_flag],
        referrer.as_ref(),
        &expiry.to_le_bytes(),
    ]);
    prefixed_digest(&message.to_bytes())
}

fn recover_signer_address(digest: &[u8; 32], signature: &[u8; 65]) -> Result<[u8; 20]> {
    let recovery_id = match signature[64] {
        0 | 1 => signature[64],
        27 | 28 => signature[64] - 27,
        _ => return err!(SaleError::InvalidSignature),
    };
    let pubkey = secp256k1_recover(digest, recovery_id, &signature[..64])
        .map_err(|_| error!(SaleError::InvalidSignature))?;
    let hash = keccak::hash(&pubkey.to_bytes());
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash.to_bytes()[12..]);
    Ok(address)
}

fn verify_capability(
    digest: &[u8; 32],
    signature: &[u8; 65],
    expected_signer: &[u8; 20],
) -> Result<()> {
    let recovered = recover_signer_address(digest, signature)?;
    require!(&recovered == expected_signer, SaleError::InvalidSignature);
    Ok(())
}

/// Burn a signature in the replay set. The caller-supplied hash must match
/// the signature bytes so the PDA address is bound to the proof.
fn consume_signature(
    used: &mut UsedSignature,
    signature: &[u8; 65],
    sig_hash: &[u8; 32],
    buyer: Pubkey,
    now: i64,
) -> Result<()> {
    let computed = keccak::hash(signature.as_ref()).to_bytes();
    require!(&computed == sig_hash, SaleError::InvalidSignatureHash);
    require!(!used.consumed, SaleError::SignatureAlreadyUsed);

    used.consumed = true;
    used.buyer = buyer;
    used.consumed_at = now;

    emit!(SignatureConsumed {
        sig_hash: *sig_hash,
        buyer,
    });
    Ok(())
}

// =====================================================
// PURCHASE / REFERRAL INTERNALS
// =====================================================

fn require_payment_mint(config: &Config, mint: &Pubkey) -> Result<()> {
    require!(
        mint == &config.usdt_mint || mint == &config.usdc_mint,
        SaleError::InvalidPaymentMint
    );
    Ok(())
}

fn oracle_usd_micro(price_update: &Account<PriceUpdateV2>, lamports: u64) -> Result<u64> {
    let price = price_update.get_price_no_older_than(
        &Clock::get()?,
        MAX_PRICE_AGE_SECS,
        &get_feed_id_from_hex(SOL_USD_FEED_ID)?,
    )?;
    lamports_to_usd_micro(lamports, price.price, price.exponent)
}

/// Shared purchase bookkeeping: pricing, cap accounting, purchase and
/// allocation ledgers, referral accrual and the purchase event. Payment
/// custody is performed by the caller afterwards.
#[allow(clippy::too_many_arguments)]
fn process_purchase(
    config: &mut Config,
    purchase: &mut UserPurchase,
    allocation: &mut UserAllocation,
    allocation_bump: u8,
    referrer_info: &AccountInfo,
    program_id: &Pubkey,
    buyer: Pubkey,
    payment_mint: Pubkey,
    paid_amount: u64,
    usd_micro: u64,
    category: VestingCategory,
    now: i64,
) -> Result<()> {
    let rate = current_rate(&config.schedule, now)?;
    require!(rate > 0, SaleError::InvalidPrice);
    let tokens = tokens_for_usd(usd_micro, rate)?;
    require!(tokens > 0, SaleError::ZeroTokens);

    grant_category(config, category, tokens)?;

    if allocation.user == Pubkey::default() {
        allocation.user = buyer;
        allocation.category = category as u8;
        allocation.allocation_time = now;
        allocation.bump = allocation_bump;
    }
    allocation.total_allocated = allocation
        .total_allocated
        .checked_add(tokens)
        .ok_or(SaleError::Overflow)?;

    if purchase.buyer == Pubkey::default() {
        purchase.buyer = buyer;
    }
    match category {
        VestingCategory::Presale => {
            purchase.presale_usd_micro = purchase
                .presale_usd_micro
                .checked_add(usd_micro)
                .ok_or(SaleError::Overflow)?;
        }
        _ => {
            purchase.public_usd_micro = purchase
                .public_usd_micro
                .checked_add(usd_micro)
                .ok_or(SaleError::Overflow)?;
        }
    }
    purchase.tokens_purchased = purchase
        .tokens_purchased
        .checked_add(tokens)
        .ok_or(SaleError::Overflow)?;
    purchase.purchase_count = purchase
        .purchase_count
        .checked_add(1)
        .ok_or(SaleError::Overflow)?;
    if purchase.purchase_count == 1 {
        purchase.first_purchase_at = now;
    }
    purchase.last_purchase_at = now;

    let mut referral_bonus = 0u128;
    if config.referral_enabled && purchase.referrer != Pubkey::default() {
        referral_bonus = credit_referral(
            config,
            purchase.referrer,
            referrer_info,
            program_id,
            usd_micro,
            tokens,
        )?;
    }

    config.tokens_sold = config
        .tokens_sold
        .checked_add(tokens)
        .ok_or(SaleError::Overflow)?;
    config.usd_raised_micro = config
        .usd_raised_micro
        .checked_add(usd_micro)
        .ok_or(SaleError::Overflow)?;
    config.total_outstanding = config
        .total_outstanding
        .checked_add(tokens)
        .ok_or(SaleError::Overflow)?;

    emit!(PurchaseRecorded {
        buyer,
        payment_mint,
        paid_amount,
        usd_micro,
        rate,
        tokens,
        category: category as u8,
        referrer: purchase.referrer,
        referral_bonus,
    });
    msg!(
        "Purchase: {} units for {} micro-USD at rate {}",
        tokens,
        usd_micro,
        rate
    );
    Ok(())
}

/// Accrue referral volume and bonus to the referrer's ledger. The bonus is
/// deferred (claimable in the sale token) and draws on the Ecosystem
/// category; an exhausted pool skips the bonus without failing the purchase.
fn credit_referral(
    config: &mut Config,
    referrer: Pubkey,
    referrer_info: &AccountInfo,
    program_id: &Pubkey,
    usd_micro: u64,
    tokens: u128,
) -> Result<u128> {
    let (expected_pda, _bump) =
        Pubkey::find_program_address(&[REFERRAL_SEED, referrer.as_ref()], program_id);
    require!(referrer_info.key() == expected_pda, SaleError::InvalidPda);
    if referrer_info.data_is_empty() {
        msg!("Referral ledger missing for {} - bonus skipped", referrer);
        return Ok(0);
    }

    let mut data = referrer_info.try_borrow_mut_data()?;
    let mut info = ReferralInfo::try_deserialize(&mut &data[..])?;
    info.total_volume_usd_micro = info
        .total_volume_usd_micro
        .checked_add(usd_micro)
        .ok_or(SaleError::Overflow)?;

    let bonus = bonus_amount(tokens, config.referral_bonus_permille)?;
    let pool = VestingCategory::Ecosystem as usize;
    let credited = if bonus == 0 {
        0
    } else {
        let new_total = config.category_allocated[pool]
            .checked_add(bonus)
            .ok_or(SaleError::Overflow)?;
        if new_total > config.category_caps[pool] {
            msg!("Referral pool exhausted - bonus skipped");
            0
        } else {
            config.category_allocated[pool] = new_total;
            config.total_outstanding = config
                .total_outstanding
                .checked_add(bonus)
                .ok_or(SaleError::Overflow)?;
            config.referral_bonus_issued = config
                .referral_bonus_issued
                .checked_add(bonus)
                .ok_or(SaleError::Overflow)?;
            info.bonus_earned = info
                .bonus_earned
                .checked_add(bonus)
                .ok_or(SaleError::Overflow)?;
            bonus
        }
    };

    info.try_serialize(&mut &mut data[..])?;
    Ok(credited)
}

/// Book a claim and pay it out of the vault. Ledger writes happen before the
/// transfer CPI.
#[allow(clippy::too_many_arguments)]
fn settle_claim<'info>(
    config: &mut Account<'info, Config>,
    allocation: &mut Account<'info, UserAllocation>,
    sale_vault: &Account<'info, TokenAccount>,
    user_sale_ata: &Account<'info, TokenAccount>,
    treasury: &SystemAccount<'info>,
    token_program: &Program<'info, Token>,
    mint_decimals: u8,
    user: Pubkey,
    category: u8,
    claimable_units: u128,
) -> Result<()> {
    let (base, accounted) = payout_base_units(claimable_units, mint_decimals)?;
    require!(base > 0, SaleError::NothingToClaim);

    allocation.claimed = allocation
        .claimed
        .checked_add(accounted)
        .ok_or(SaleError::Overflow)?;
    config.total_outstanding = config
        .total_outstanding
        .checked_sub(accounted)
        .ok_or(SaleError::Overflow)?;

    let treasury_seeds = &[TREASURY_SEED, &[config.treasury_bump]];
    let signer_seeds = &[&treasury_seeds[..]];
    let cpi_ctx = CpiContext::new_with_signer(
        token_program.to_account_info(),
        Transfer {
            from: sale_vault.to_account_info(),
            to: user_sale_ata.to_account_info(),
            authority: treasury.to_account_info(),
        },
        signer_seeds,
    );
    token::transfer(cpi_ctx, base)?;

    emit!(TokensClaimed {
        user,
        category,
        amount_units: accounted,
        amount_base: base,
    });
    msg!("Claimed {} base units in category {}", base, category);
    Ok(())
}

// =====================================================
// ACCOUNT CONTEXTS
// =====================================================

#[derive(Accounts)]
pub struct Initialize<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(
        init,
        payer = admin,
        seeds = [CONFIG_SEED],
        bump,
        space = 8 + Config::SPACE
    )]
    pub config: Account<'info, Config>,

    /// Holds collected SOL and owns the custody token accounts.
    #[account(seeds = [TREASURY_SEED], bump)]
    pub treasury: SystemAccount<'info>,

    pub sale_mint: Account<'info, Mint>,
    pub usdt_mint: Account<'info, Mint>,
    pub usdc_mint: Account<'info, Mint>,

    #[account(
        init,
        payer = admin,
        associated_token::mint = sale_mint,
        associated_token::authority = treasury,
    )]
    pub sale_vault: Account<'info, TokenAccount>,

    #[account(mut)]
    pub sale_ata_for_admin: Account<'info, TokenAccount>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct AdminUpdate<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,
}

#[derive(Accounts)]
#[instruction(referrer: Pubkey)]
pub struct RegisterReferrer<'info> {
    #[account(mut)]
    pub user: Signer<'info>,

    #[account(seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        init_if_needed,
        payer = user,
        seeds = [PURCHASE_SEED, user.key().as_ref()],
        bump,
        space = 8 + UserPurchase::SPACE
    )]
    pub user_purchase: Account<'info, UserPurchase>,

    #[account(
        init_if_needed,
        payer = user,
        seeds = [REFERRAL_SEED, referrer.as_ref()],
        bump,
        space = 8 + ReferralInfo::SPACE
    )]
    pub referral_info: Account<'info, ReferralInfo>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(usd_amount: u64, nonce: u64, signature: [u8; 65], sig_hash: [u8; 32])]
pub struct BuyWithStablecoinWhitelist<'info> {
    #[account(mut)]
    pub buyer: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [PURCHASE_SEED, buyer.key().as_ref()],
        bump,
        space = 8 + UserPurchase::SPACE
    )]
    pub user_purchase: Account<'info, UserPurchase>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [ALLOCATION_SEED, buyer.key().as_ref(), &[VestingCategory::Presale as u8]],
        bump,
        space = 8 + UserAllocation::SPACE
    )]
    pub sale_allocation: Account<'info, UserAllocation>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [USED_SIG_SEED, sig_hash.as_ref()],
        bump,
        space = 8 + UsedSignature::SPACE
    )]
    pub used_signature: Account<'info, UsedSignature>,

    /// CHECK: referrer ledger PDA, validated against its expected address and
    /// deserialized manually when a referrer is on file
    #[account(mut)]
    pub referrer_info: UncheckedAccount<'info>,

    pub payment_mint: Account<'info, Mint>,

    #[account(mut, token::mint = payment_mint, token::authority = buyer)]
    pub payment_ata_for_buyer: Account<'info, TokenAccount>,

    #[account(
        init_if_needed,
        payer = buyer,
        associated_token::mint = payment_mint,
        associated_token::authority = treasury,
    )]
    pub payment_ata_for_treasury: Account<'info, TokenAccount>,

    #[account(seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct BuyWithStablecoin<'info> {
    #[account(mut)]
    pub buyer: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [PURCHASE_SEED, buyer.key().as_ref()],
        bump,
        space = 8 + UserPurchase::SPACE
    )]
    pub user_purchase: Account<'info, UserPurchase>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [ALLOCATION_SEED, buyer.key().as_ref(), &[VestingCategory::PublicSale as u8]],
        bump,
        space = 8 + UserAllocation::SPACE
    )]
    pub sale_allocation: Account<'info, UserAllocation>,

    /// CHECK: referrer ledger PDA, validated against its expected address and
    /// deserialized manually when a referrer is on file
    #[account(mut)]
    pub referrer_info: UncheckedAccount<'info>,

    pub payment_mint: Account<'info, Mint>,

    #[account(mut, token::mint = payment_mint, token::authority = buyer)]
    pub payment_ata_for_buyer: Account<'info, TokenAccount>,

    #[account(
        init_if_needed,
        payer = buyer,
        associated_token::mint = payment_mint,
        associated_token::authority = treasury,
    )]
    pub payment_ata_for_treasury: Account<'info, TokenAccount>,

    #[account(seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(lamports: u64, nonce: u64, signature: [u8; 65], sig_hash: [u8; 32])]
pub struct BuyWithSolWhitelist<'info> {
    #[account(mut)]
    pub buyer: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [PURCHASE_SEED, buyer.key().as_ref()],
        bump,
        space = 8 + UserPurchase::SPACE
    )]
    pub user_purchase: Account<'info, UserPurchase>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [ALLOCATION_SEED, buyer.key().as_ref(), &[VestingCategory::Presale as u8]],
        bump,
        space = 8 + UserAllocation::SPACE
    )]
    pub sale_allocation: Account<'info, UserAllocation>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [USED_SIG_SEED, sig_hash.as_ref()],
        bump,
        space = 8 + UsedSignature::SPACE
    )]
    pub used_signature: Account<'info, UsedSignature>,

    /// CHECK: referrer ledger PDA, validated against its expected address and
    /// deserialized manually when a referrer is on file
    #[account(mut)]
    pub referrer_info: UncheckedAccount<'info>,

    /// Pyth SOL/USD price account
    pub pyth_sol_usd_price: Account<'info, PriceUpdateV2>,

    #[account(mut, seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct BuyWithSol<'info> {
    #[account(mut)]
    pub buyer: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [PURCHASE_SEED, buyer.key().as_ref()],
        bump,
        space = 8 + UserPurchase::SPACE
    )]
    pub user_purchase: Account<'info, UserPurchase>,

    #[account(
        init_if_needed,
        payer = buyer,
        seeds = [ALLOCATION_SEED, buyer.key().as_ref(), &[VestingCategory::PublicSale as u8]],
        bump,
        space = 8 + UserAllocation::SPACE
    )]
    pub sale_allocation: Account<'info, UserAllocation>,

    /// CHECK: referrer ledger PDA, validated against its expected address and
    /// deserialized manually when a referrer is on file
    #[account(mut)]
    pub referrer_info: UncheckedAccount<'info>,

    /// Pyth SOL/USD price account
    pub pyth_sol_usd_price: Account<'info, PriceUpdateV2>,

    #[account(mut, seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(
    amount: u128,
    nonce: u64,
    chain_id: u64,
    category_flag: u8,
    referrer: Pubkey,
    expiry: i64,
    signature: [u8; 65],
    sig_hash: [u8; 32]
)]
pub struct DistributeCrossChain<'info> {
    #[account(mut)]
    pub claimant: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        init_if_needed,
        payer = claimant,
        seeds = [PURCHASE_SEED, claimant.key().as_ref()],
        bump,
        space = 8 + UserPurchase::SPACE
    )]
    pub user_purchase: Account<'info, UserPurchase>,

    #[account(
        init_if_needed,
        payer = claimant,
        seeds = [ALLOCATION_SEED, claimant.key().as_ref(), &[category_flag]],
        bump,
        space = 8 + UserAllocation::SPACE
    )]
    pub sale_allocation: Account<'info, UserAllocation>,

    #[account(
        init_if_needed,
        payer = claimant,
        seeds = [USED_SIG_SEED, sig_hash.as_ref()],
        bump,
        space = 8 + UsedSignature::SPACE
    )]
    pub used_signature: Account<'info, UsedSignature>,

    /// CHECK: referrer ledger PDA, validated against its expected address and
    /// deserialized manually when a referrer is on file
    #[account(mut)]
    pub referrer_info: UncheckedAccount<'info>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(category: u8)]
pub struct AllocateTokens<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    /// CHECK: allocation recipient, only its address is recorded
    pub recipient: UncheckedAccount<'info>,

    #[account(
        init_if_needed,
        payer = admin,
        seeds = [ALLOCATION_SEED, recipient.key().as_ref(), &[category]],
        bump,
        space = 8 + UserAllocation::SPACE
    )]
    pub allocation: Account<'info, UserAllocation>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(category: u8)]
pub struct ClaimTokens<'info> {
    #[account(mut)]
    pub user: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        mut,
        seeds = [ALLOCATION_SEED, user.key().as_ref(), &[category]],
        bump = allocation.bump
    )]
    pub allocation: Account<'info, UserAllocation>,

    #[account(address = config.sale_mint @ SaleError::InvalidSaleMint)]
    pub sale_mint: Account<'info, Mint>,

    #[account(
        mut,
        associated_token::mint = sale_mint,
        associated_token::authority = treasury,
    )]
    pub sale_vault: Account<'info, TokenAccount>,

    #[account(
        init_if_needed,
        payer = user,
        associated_token::mint = sale_mint,
        associated_token::authority = user,
    )]
    pub user_sale_ata: Account<'info, TokenAccount>,

    #[account(seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct ClaimReferralBonus<'info> {
    #[account(mut)]
    pub user: Signer<'info>,

    #[account(mut, seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        mut,
        seeds = [REFERRAL_SEED, user.key().as_ref()],
        bump = referral_info.bump
    )]
    pub referral_info: Account<'info, ReferralInfo>,

    #[account(address = config.sale_mint @ SaleError::InvalidSaleMint)]
    pub sale_mint: Account<'info, Mint>,

    #[account(
        mut,
        associated_token::mint = sale_mint,
        associated_token::authority = treasury,
    )]
    pub sale_vault: Account<'info, TokenAccount>,

    #[account(
        init_if_needed,
        payer = user,
        associated_token::mint = sale_mint,
        associated_token::authority = user,
    )]
    pub user_sale_ata: Account<'info, TokenAccount>,

    #[account(seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
#[instruction(category: u8, owner: Pubkey)]
pub struct GetClaimableAmount<'info> {
    #[account(seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(
        seeds = [ALLOCATION_SEED, owner.as_ref(), &[category]],
        bump = allocation.bump
    )]
    pub allocation: Account<'info, UserAllocation>,
}

#[derive(Accounts)]
pub struct WithdrawFunds<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    pub payment_mint: Account<'info, Mint>,

    #[account(
        mut,
        associated_token::mint = payment_mint,
        associated_token::authority = treasury,
    )]
    pub payment_ata_for_treasury: Account<'info, TokenAccount>,

    #[account(
        init_if_needed,
        payer = admin,
        associated_token::mint = payment_mint,
        associated_token::authority = admin,
    )]
    pub payment_ata_for_admin: Account<'info, TokenAccount>,

    #[account(seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct WithdrawSol<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(mut, seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub system_program: Program<'info, System>,
}

#[derive(Accounts)]
pub struct EmergencyTokenWithdraw<'info> {
    #[account(mut)]
    pub admin: Signer<'info>,

    #[account(seeds = [CONFIG_SEED], bump = config.bump)]
    pub config: Account<'info, Config>,

    #[account(address = config.sale_mint @ SaleError::InvalidSaleMint)]
    pub sale_mint: Account<'info, Mint>,

    #[account(
        mut,
        associated_token::mint = sale_mint,
        associated_token::authority = treasury,
    )]
    pub sale_vault: Account<'info, TokenAccount>,

    #[account(
        init_if_needed,
        payer = admin,
        associated_token::mint = sale_mint,
        associated_token::authority = admin,
    )]
    pub sale_ata_for_admin: Account<'info, TokenAccount>,

    #[account(seeds = [TREASURY_SEED], bump = config.treasury_bump)]
    pub treasury: SystemAccount<'info>,

    pub token_program: Program<'info, Token>,
    pub associated_token_program: Program<'info, AssociatedToken>,
    pub system_program: Program<'info, System>,
}

// =====================================================
// STATE
// =====================================================

/// Sale phase derived from the schedule and the clock. Never stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SalePhase {
    NotStarted,
    PresaleWhitelist,
    PublicSale,
    Ended,
}

/// Vesting buckets. The two sale categories are fed by purchases and
/// cross-chain distribution; the rest only by manual allocation.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VestingCategory {
    Presale,
    PublicSale,
    Liquidity,
    TeamAdvisors,
    Ecosystem,
    Treasury,
    Marketing,
}

impl VestingCategory {
    pub const COUNT: usize = 7;

    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            0 => Ok(Self::Presale),
            1 => Ok(Self::PublicSale),
            2 => Ok(Self::Liquidity),
            3 => Ok(Self::TeamAdvisors),
            4 => Ok(Self::Ecosystem),
            5 => Ok(Self::Treasury),
            6 => Ok(Self::Marketing),
            _ => err!(SaleError::InvalidCategory),
        }
    }
}

/// Per-category release schedule. tge_permille is the share unlocked at TGE
/// (out of 1000), months are multiples of `Config::seconds_per_month`.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VestingConfig {
    pub tge_permille: u16,
    pub cliff_months: u32,
    pub vesting_months: u32,
}

/// Phase boundaries and pricing. Rates are micro-USD per whole token.
#[derive(AnchorSerialize, AnchorDeserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaleSchedule {
    pub presale_start: i64,
    pub presale_end: i64,
    pub public_start: i64,
    pub public_end: i64,
    pub presale_rate: u64,
    pub public_start_rate: u64,
    pub price_increase_interval: i64,
    pub price_increase_amount: u64,
}

#[derive(AnchorSerialize, AnchorDeserialize, Clone)]
pub struct InitializeParams {
    pub schedule: SaleSchedule,
    pub category_caps: [u128; VestingCategory::COUNT],
    pub vesting_configs: [VestingConfig; VestingCategory::COUNT],
    pub seconds_per_month: i64,
    pub referral_enabled: bool,
    pub referral_bonus_permille: u16,
    pub backend_signer: [u8; 20],
    pub distribution_signer: [u8; 20],
    pub vault_deposit: u64,
}

#[account]
pub struct Config {
    pub admin: Pubkey,                                          // 32
    pub sale_mint: Pubkey,                                      // 32
    pub usdt_mint: Pubkey,                                      // 32
    pub usdc_mint: Pubkey,                                      // 32
    pub bump: u8,                                               // 1
    pub treasury_bump: u8,                                      // 1
    pub schedule: SaleSchedule,                                 // 64
    pub tge_timestamp: i64,                                     // 8 - 0 until scheduled
    pub seconds_per_month: i64,                                 // 8 - injected month length
    pub referral_enabled: bool,                                 // 1
    pub referral_bonus_permille: u16,                           // 2
    pub backend_signer: [u8; 20],                               // 20
    pub distribution_signer: [u8; 20],                          // 20
    pub paused: bool,                                           // 1
    pub category_caps: [u128; VestingCategory::COUNT],          // 112
    pub category_allocated: [u128; VestingCategory::COUNT],     // 112
    pub vesting_configs: [VestingConfig; VestingCategory::COUNT], // 70
    pub tokens_sold: u128,                                      // 16
    pub cross_chain_sold: u128,                                 // 16
    pub usd_raised_micro: u64,                                  // 8
    pub total_outstanding: u128,                                // 16 - allocated, not yet paid out
    pub referral_bonus_issued: u128,                            // 16
}

impl Config {
    pub const SPACE: usize =
        32 + 32 + 32 + 32 + 1 + 1 + 64 + 8 + 8 + 1 + 2 + 20 + 20 + 1 + 112 + 112 + 70 + 16 + 16 + 8 + 16 + 16;
}

/// Per-buyer purchase record. The referrer link is immutable once set.
#[account]
pub struct UserPurchase {
    pub buyer: Pubkey,           // 32
    pub presale_usd_micro: u64,  // 8
    pub public_usd_micro: u64,   // 8
    pub tokens_purchased: u128,  // 16
    pub purchase_count: u32,     // 4
    pub first_purchase_at: i64,  // 8
    pub last_purchase_at: i64,   // 8
    pub referrer: Pubkey,        // 32
}

impl UserPurchase {
    pub const SPACE: usize = 32 + 8 + 8 + 16 + 4 + 8 + 8 + 32;
}

/// Per (user, category) vesting ledger entry.
#[account]
pub struct UserAllocation {
    pub user: Pubkey,          // 32
    pub category: u8,          // 1
    pub total_allocated: u128, // 16
    pub claimed: u128,         // 16
    pub allocation_time: i64,  // 8
    pub bump: u8,              // 1
}

impl UserAllocation {
    pub const SPACE: usize = 32 + 1 + 16 + 16 + 8 + 1;
}

/// Per-referrer aggregate ledger.
#[account]
pub struct ReferralInfo {
    pub referrer: Pubkey,              // 32
    pub total_referred: u32,           // 4
    pub total_volume_usd_micro: u64,   // 8
    pub bonus_earned: u128,            // 16
    pub bonus_claimed: u128,           // 16
    pub bump: u8,                      // 1
}

impl ReferralInfo {
    pub const SPACE: usize = 32 + 4 + 8 + 16 + 16 + 1;
}

/// Replay-set entry, keyed by the keccak hash of the signature bytes.
#[account]
pub struct UsedSignature {
    pub buyer: Pubkey,     // 32
    pub consumed: bool,    // 1
    pub consumed_at: i64,  // 8
    pub bump: u8,          // 1
}

impl UsedSignature {
    pub const SPACE: usize = 32 + 1 + 8 + 1;
}

// =====================================================
// EVENTS
// =====================================================

#[event]
pub struct SaleInitialized {
    pub admin: Pubkey,
    pub sale_mint: Pubkey,
    pub presale_start: i64,
    pub public_end: i64,
}

#[event]
pub struct SaleConfigured {
    pub presale_start: i64,
    pub presale_end: i64,
    pub public_start: i64,
    pub public_end: i64,
}

#[event]
pub struct TgeScheduled {
    pub tge_timestamp: i64,
}

#[event]
pub struct SalePauseSet {
    pub paused: bool,
}

#[event]
pub struct PurchaseRecorded {
    pub buyer: Pubkey,
    pub payment_mint: Pubkey,
    pub paid_amount: u64,
    pub usd_micro: u64,
    pub rate: u64,
    pub tokens: u128,
    pub category: u8,
    pub referrer: Pubkey,
    pub referral_bonus: u128,
}

#[event]
pub struct ReferralRecorded {
    pub user: Pubkey,
    pub referrer: Pubkey,
}

#[event]
pub struct TokensAllocated {
    pub recipient: Pubkey,
    pub category: u8,
    pub amount: u128,
    pub category_total: u128,
}

#[event]
pub struct TokensDistributed {
    pub claimant: Pubkey,
    pub category: u8,
    pub amount: u128,
    pub chain_id: u64,
    pub referral_bonus: u128,
}

#[event]
pub struct TokensClaimed {
    pub user: Pubkey,
    pub category: u8,
    pub amount_units: u128,
    pub amount_base: u64,
}

#[event]
pub struct ReferralBonusClaimed {
    pub referrer: Pubkey,
    pub amount_units: u128,
    pub amount_base: u64,
}

#[event]
pub struct SignatureConsumed {
    pub sig_hash: [u8; 32],
    pub buyer: Pubkey,
}

#[event]
pub struct FundsWithdrawn {
    pub currency: Pubkey,
    pub amount: u64,
}

// =====================================================
// TESTS
// =====================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SPM: i64 = 2_592_000; // 30 days
    const TOTAL: u128 = 1_000_000 * TOKEN_UNIT;

    fn sched() -> SaleSchedule {
        SaleSchedule {
            presale_start: 1_000,
            presale_end: 2_000,
            public_start: 3_000,
            public_end: 9_000,
            presale_rate: 25_000,
            public_start_rate: 100_000,
            price_increase_interval: 600,
            price_increase_amount: 10_000,
        }
    }

    fn test_config() -> Config {
        Config {
            admin: Pubkey::new_unique(),
            sale_mint: Pubkey::new_unique(),
            usdt_mint: Pubkey::new_unique(),
            usdc_mint: Pubkey::new_unique(),
            bump: 255,
            treasury_bump: 255,
            schedule: sched(),
            tge_timestamp: 0,
            seconds_per_month: SPM,
            referral_enabled: true,
            referral_bonus_permille: 50,
            backend_signer: [1u8; 20],
            distribution_signer: [2u8; 20],
            paused: false,
            category_caps: [1_000 * TOKEN_UNIT; VestingCategory::COUNT],
            category_allocated: [0; VestingCategory::COUNT],
            vesting_configs: [VestingConfig::default(); VestingCategory::COUNT],
            tokens_sold: 0,
            cross_chain_sold: 0,
            usd_raised_micro: 0,
            total_outstanding: 0,
            referral_bonus_issued: 0,
        }
    }

    #[test]
    fn phase_boundaries() {
        let s = sched();
        assert_eq!(sale_phase(&s, 999), SalePhase::NotStarted);
        assert_eq!(sale_phase(&s, 1_000), SalePhase::PresaleWhitelist);
        assert_eq!(sale_phase(&s, 1_999), SalePhase::PresaleWhitelist);
        // gap between the windows
        assert_eq!(sale_phase(&s, 2_000), SalePhase::NotStarted);
        assert_eq!(sale_phase(&s, 2_999), SalePhase::NotStarted);
        assert_eq!(sale_phase(&s, 3_000), SalePhase::PublicSale);
        assert_eq!(sale_phase(&s, 8_999), SalePhase::PublicSale);
        assert_eq!(sale_phase(&s, 9_000), SalePhase::Ended);
        assert_eq!(sale_phase(&s, i64::MAX), SalePhase::Ended);
    }

    #[test]
    fn phase_contiguous_windows() {
        let mut s = sched();
        s.presale_end = 3_000;
        assert_eq!(sale_phase(&s, 2_999), SalePhase::PresaleWhitelist);
        assert_eq!(sale_phase(&s, 3_000), SalePhase::PublicSale);
    }

    #[test]
    fn rate_step_function() {
        let s = sched();
        assert_eq!(current_rate(&s, 500).unwrap(), 0);
        assert_eq!(current_rate(&s, 1_500).unwrap(), 25_000);
        assert_eq!(current_rate(&s, 2_500).unwrap(), 0);
        assert_eq!(current_rate(&s, 3_000).unwrap(), 100_000);
        assert_eq!(current_rate(&s, 3_599).unwrap(), 100_000);
        assert_eq!(current_rate(&s, 3_600).unwrap(), 110_000);
        assert_eq!(current_rate(&s, 4_200).unwrap(), 120_000);
        assert_eq!(current_rate(&s, 9_000).unwrap(), 0);
    }

    #[test]
    fn rate_is_non_decreasing_during_public_window() {
        let s = sched();
        let mut last = 0u64;
        let mut t = s.public_start;
        while t < s.public_end {
            let r = current_rate(&s, t).unwrap();
            assert!(r >= last);
            last = r;
            t += 50;
        }
    }

    #[test]
    fn presale_token_math() {
        // 1000 USD at $0.025 per token buys exactly 40000 tokens
        let tokens = tokens_for_usd(1_000_000_000, 25_000).unwrap();
        assert_eq!(tokens, 40_000 * TOKEN_UNIT);
    }

    #[test]
    fn public_token_math_after_one_interval() {
        let s = sched();
        let rate = current_rate(&s, s.public_start + s.price_increase_interval).unwrap();
        assert_eq!(rate, 110_000);

        let usd: u128 = 1_000_000_000;
        let tokens = tokens_for_usd(usd as u64, rate).unwrap();
        assert_eq!(tokens, usd * TOKEN_UNIT / 110_000);
        // floor division: value bracketed by rate
        assert!(tokens * 110_000 <= usd * TOKEN_UNIT);
        assert!((tokens + 1) * 110_000 > usd * TOKEN_UNIT);
    }

    #[test]
    fn zero_rate_is_rejected() {
        assert!(tokens_for_usd(1_000_000, 0).is_err());
    }

    #[test]
    fn tge_amount_permille() {
        assert_eq!(tge_amount(TOTAL, 0).unwrap(), 0);
        assert_eq!(tge_amount(TOTAL, 200).unwrap(), TOTAL / 5);
        assert_eq!(tge_amount(TOTAL, 1_000).unwrap(), TOTAL);
    }

    #[test]
    fn vesting_with_cliff_and_no_tge_unlock() {
        // tge 0%, 12 month cliff, 24 month vesting
        let vc = VestingConfig {
            tge_permille: 0,
            cliff_months: 12,
            vesting_months: 24,
        };
        let tge_ts = 1_000_000;

        assert_eq!(vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts - 1).unwrap(), 0);
        assert_eq!(vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts).unwrap(), 0);
        assert_eq!(
            vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 11 * SPM).unwrap(),
            0
        );

        // at the cliff boundary half the linear window has elapsed
        let at_cliff = vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 12 * SPM).unwrap();
        assert_eq!(at_cliff, TOTAL / 2);
        assert!(at_cliff > 0 && at_cliff < TOTAL);

        assert_eq!(
            vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 24 * SPM).unwrap(),
            TOTAL
        );
        assert_eq!(
            vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 100 * SPM).unwrap(),
            TOTAL
        );
    }

    #[test]
    fn vesting_with_tge_unlock_and_no_cliff() {
        // tge 20%, no cliff, 6 month vesting
        let vc = VestingConfig {
            tge_permille: 200,
            cliff_months: 0,
            vesting_months: 6,
        };
        let tge_ts = 1_000_000;

        let at_tge = vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts).unwrap();
        assert_eq!(at_tge, TOTAL / 5);

        // halfway through vesting: 20% + half of the remaining 80%
        let mid = vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 3 * SPM).unwrap();
        assert_eq!(mid, TOTAL * 600 / 1_000);
        assert_eq!(mid - at_tge, (TOTAL - at_tge) / 2);

        assert_eq!(
            vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 6 * SPM).unwrap(),
            TOTAL
        );
    }

    #[test]
    fn vesting_without_vesting_period_releases_tge_only() {
        let vc = VestingConfig {
            tge_permille: 200,
            cliff_months: 0,
            vesting_months: 0,
        };
        let tge_ts = 1_000_000;
        assert_eq!(
            vested_amount(TOTAL, &vc, tge_ts, SPM, tge_ts + 1_000 * SPM).unwrap(),
            TOTAL / 5
        );
    }

    #[test]
    fn vesting_before_tge_or_unset_tge_is_zero() {
        let vc = VestingConfig {
            tge_permille: 1_000,
            cliff_months: 0,
            vesting_months: 0,
        };
        assert_eq!(vested_amount(TOTAL, &vc, 0, SPM, 5_000_000).unwrap(), 0);
        assert_eq!(
            vested_amount(TOTAL, &vc, 1_000_000, SPM, 999_999).unwrap(),
            0
        );
    }

    #[test]
    fn vested_amount_is_monotonic() {
        let vc = VestingConfig {
            tge_permille: 150,
            cliff_months: 3,
            vesting_months: 18,
        };
        let tge_ts = 500_000;
        let mut last = 0u128;
        let mut t = tge_ts - SPM;
        while t < tge_ts + 20 * SPM {
            let v = vested_amount(TOTAL, &vc, tge_ts, SPM, t).unwrap();
            assert!(v >= last);
            assert!(v <= TOTAL);
            last = v;
            t += SPM / 4;
        }
    }

    #[test]
    fn category_caps_enforced() {
        let mut config = test_config();
        let cap = config.category_caps[VestingCategory::Presale as usize];

        grant_category(&mut config, VestingCategory::Presale, cap - 100).unwrap();
        grant_category(&mut config, VestingCategory::Presale, 100).unwrap();
        assert!(grant_category(&mut config, VestingCategory::Presale, 1).is_err());
        assert_eq!(
            config.category_allocated[VestingCategory::Presale as usize],
            cap
        );

        // other categories are unaffected
        grant_category(&mut config, VestingCategory::Treasury, 100).unwrap();
        assert_eq!(
            config.category_allocated[VestingCategory::Treasury as usize],
            100
        );
    }

    #[test]
    fn payout_scaling_and_dust() {
        let (base, accounted) = payout_base_units(40_000 * TOKEN_UNIT, 9).unwrap();
        assert_eq!(base, 40_000 * 1_000_000_000);
        assert_eq!(accounted, 40_000 * TOKEN_UNIT);

        // sub-base dust stays unaccounted and therefore claimable later
        let (base, accounted) = payout_base_units(1_999_999_999, 9).unwrap();
        assert_eq!(base, 1);
        assert_eq!(accounted, 1_000_000_000);

        let (base, accounted) = payout_base_units(123_456, 18).unwrap();
        assert_eq!(base, 123_456);
        assert_eq!(accounted, 123_456);

        assert!(unit_scale(19).is_err());
    }

    #[test]
    fn oracle_conversion() {
        // 1 SOL at $150.00 (expo -8) is 150 USD
        assert_eq!(
            lamports_to_usd_micro(1_000_000_000, 15_000_000_000, -8).unwrap(),
            150_000_000
        );
        // half a SOL
        assert_eq!(
            lamports_to_usd_micro(500_000_000, 15_000_000_000, -8).unwrap(),
            75_000_000
        );
        assert!(lamports_to_usd_micro(1, 0, -8).is_err());
        assert!(lamports_to_usd_micro(1, -5, -8).is_err());
    }

    #[test]
    fn referral_bonus_math() {
        assert_eq!(bonus_amount(1_000 * TOKEN_UNIT, 50).unwrap(), 50 * TOKEN_UNIT);
        assert_eq!(bonus_amount(1_000 * TOKEN_UNIT, 0).unwrap(), 0);
        assert_eq!(
            bonus_amount(1_000 * TOKEN_UNIT, 1_000).unwrap(),
            1_000 * TOKEN_UNIT
        );
    }

    #[test]
    fn schedule_validation() {
        assert!(validate_schedule(&sched()).is_ok());

        let mut s = sched();
        s.presale_end = s.presale_start;
        assert!(validate_schedule(&s).is_err());

        let mut s = sched();
        s.public_start = s.presale_end - 1;
        assert!(validate_schedule(&s).is_err());

        let mut s = sched();
        s.public_end = s.public_start;
        assert!(validate_schedule(&s).is_err());

        let mut s = sched();
        s.price_increase_interval = 0;
        assert!(validate_schedule(&s).is_err());

        let mut s = sched();
        s.presale_rate = 0;
        assert!(validate_schedule(&s).is_err());
    }

    #[test]
    fn purchase_digest_binds_every_field() {
        let buyer = Pubkey::new_unique();
        let other = Pubkey::new_unique();
        let pid = crate::ID;

        let d = purchase_digest(&buyer, 100, 1, &pid);
        assert_eq!(d, purchase_digest(&buyer, 100, 1, &pid));
        assert_ne!(d, purchase_digest(&buyer, 101, 1, &pid));
        assert_ne!(d, purchase_digest(&buyer, 100, 2, &pid));
        assert_ne!(d, purchase_digest(&other, 100, 1, &pid));
        assert_ne!(d, purchase_digest(&buyer, 100, 1, &other));
    }

    #[test]
    fn distribution_digest_binds_every_field() {
        let claimant = Pubkey::new_unique();
        let referrer = Pubkey::new_unique();
        let pid = crate::ID;

        let d = distribution_digest(&claimant, 10, 1, &pid, 1, 0, &referrer, 5_000);
        assert_eq!(
            d,
            distribution_digest(&claimant, 10, 1, &pid, 1, 0, &referrer, 5_000)
        );
        assert_ne!(
            d,
            distribution_digest(&claimant, 10, 1, &pid, 56, 0, &referrer, 5_000)
        );
        assert_ne!(
            d,
            distribution_digest(&claimant, 10, 1, &pid, 1, 1, &referrer, 5_000)
        );
        assert_ne!(
            d,
            distribution_digest(&claimant, 10, 1, &pid, 1, 0, &referrer, 6_000)
        );
        assert_ne!(
            d,
            distribution_digest(&claimant, 10, 2, &pid, 1, 0, &referrer, 5_000)
        );
        // the two capability kinds never collide
        let buyer_digest = purchase_digest(&claimant, 10, 1, &pid);
        assert_ne!(d, buyer_digest);
    }

    #[test]
    fn signature_replay_is_rejected() {
        let mut used = UsedSignature {
            buyer: Pubkey::default(),
            consumed: false,
            consumed_at: 0,
            bump: 0,
        };
        let signature = [7u8; 65];
        let sig_hash = keccak::hash(&signature).to_bytes();
        let buyer = Pubkey::new_unique();

        consume_signature(&mut used, &signature, &sig_hash, buyer, 1_000).unwrap();
        assert!(used.consumed);
        assert_eq!(used.buyer, buyer);

        let second = consume_signature(&mut used, &signature, &sig_hash, buyer, 1_001);
        assert!(second.is_err());
    }

    #[test]
    fn signature_hash_must_match_signature() {
        let mut used = UsedSignature {
            buyer: Pubkey::default(),
            consumed: false,
            consumed_at: 0,
            bump: 0,
        };
        let signature = [7u8; 65];
        let wrong_hash = [0u8; 32];
        assert!(consume_signature(
            &mut used,
            &signature,
            &wrong_hash,
            Pubkey::new_unique(),
            1_000
        )
        .is_err());
        assert!(!used.consumed);
    }

    #[test]
    fn malformed_recovery_byte_is_rejected() {
        let digest = [1u8; 32];
        let mut signature = [2u8; 65];
        signature[64] = 5;
        assert!(recover_signer_address(&digest, &signature).is_err());
    }
}
