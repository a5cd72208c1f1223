//! Basic ledger usage example

use market_ledger::utils::{MemoryStorage, StrictTransferValidator};
use market_ledger::{
    patterns, AccountRef, AuthContext, CurrencyToken, Holding, Ledger, LedgerConfig,
    MarketSnapshot,
};
use bigdecimal::BigDecimal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Market Ledger - Basic Example\n");

    let config = LedgerConfig::from_toml_str(
        r#"
        [deployment]
        minting_enabled = true
        "#,
    )?;
    let storage = MemoryStorage::new();
    let ledger = Ledger::with_validator(storage.clone(), config, Box::new(StrictTransferValidator));

    // 1. Accounts
    ledger.init_authority(CurrencyToken::Mana).await?;
    for user in ["alice", "bob"] {
        let account = ledger.open_user_account(user).await?;
        println!("  opened {} ({})", account.account_ref, account.token);
    }
    ledger.open_market_pool("will-it-rain").await?;
    println!();

    // 2. Mint and move currency
    let alice = ledger.auth_for("alice");
    let deposit = ledger.add_free_deposit(&alice, BigDecimal::from(1000)).await?;
    println!("  minted {} to {} ({})", deposit.amount, deposit.destination, deposit.id);

    let tip = patterns::user_transfer("alice", "bob", BigDecimal::from(150), CurrencyToken::Mana, "tip")?;
    ledger.apply_transfer(&tip, &alice).await?;

    let liquidity =
        patterns::add_liquidity("bob", "will-it-rain", BigDecimal::from(50), CurrencyToken::Mana)?;
    ledger.apply_transfer(&liquidity, &ledger.auth_for("bob")).await?;

    let overdraw = patterns::user_transfer("bob", "alice", BigDecimal::from(500), CurrencyToken::Mana, "oops")?;
    if let Err(e) = ledger.apply_transfer(&overdraw, &AuthContext::anonymous()).await {
        println!("  rejected: {}", e);
    }
    println!();

    // 3. Balances
    for account_ref in [
        AccountRef::user("alice"),
        AccountRef::user("bob"),
        AccountRef::market_pool("will-it-rain"),
    ] {
        println!("  {:<28} {}", account_ref.to_string(), ledger.get_balance(&account_ref).await?);
    }
    println!();

    // 4. Unrealized value of open positions
    storage.upsert_market(MarketSnapshot::single_outcome(
        "will-it-rain",
        "0.65".parse()?,
    ));
    storage.upsert_holding(Holding::new(
        "bob",
        "will-it-rain",
        None,
        BigDecimal::from(40),
        BigDecimal::from(10),
    ));
    let values = ledger
        .invested_values(&["alice".to_string(), "bob".to_string()])
        .await?;
    for (user, value) in &values {
        println!("  invested value of {}: {}", user, value);
    }
    println!();

    // 5. Integrity
    let report = ledger.validate_integrity().await?;
    println!(
        "  integrity: {} ({} accounts, {} transactions)",
        if report.is_valid { "ok" } else { "FAILED" },
        report.accounts_checked,
        report.transactions_checked
    );

    Ok(())
}
