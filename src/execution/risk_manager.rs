use rust_decimal::Decimal;

use crate::config::RiskConfig;
use crate::models::{FillEvent, MirrorPosition, PortfolioSnapshot, Side};
use crate::polymarket::MarketMeta;

use super::ledger::LedgerView;

/// Venue-wide minimum order notional in USD.
pub const MIN_ORDER_USD: Decimal = Decimal::ONE;

/// Everything the decision function may read. All references; `decide` never
/// suspends and never mutates.
pub struct RiskContext<'a> {
    pub snapshot: Option<&'a PortfolioSnapshot>,
    pub previous_snapshot: Option<&'a PortfolioSnapshot>,
    pub market: Option<&'a MarketMeta>,
    pub mirror_position: Option<&'a MirrorPosition>,
    pub ledger: &'a LedgerView,
    /// Set once a deferred SELL has exhausted its wait for a fresh portfolio
    /// snapshot; derivation then falls back to the fill itself.
    pub allow_stale_sell: bool,
}

/// Outcome of sizing a leader fill.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Place a BUY mirror.
    Buy {
        mirror_usd: Decimal,
        shares: Decimal,
        note: String,
    },
    /// Reduce the mirror position by this fraction of its current size.
    Reduce { fraction: Decimal, note: String },
    /// Refused by a risk gate. Final verdict; the fill is marked processed.
    Reject { reason: String },
    /// Retry on a later tick (SELL waiting for a post-fill snapshot).
    Defer { reason: String },
    /// Nothing to do (e.g. SELL with no mirror position). Final verdict.
    Skip { reason: String },
}

/// Size a leader fill and run the risk-gate cascade. First failure wins.
pub fn decide(fill: &FillEvent, ctx: &RiskContext<'_>, cfg: &RiskConfig) -> Decision {
    match fill.side {
        Side::Buy => decide_buy(fill, ctx, cfg),
        Side::Sell => decide_sell(fill, ctx),
    }
}

fn decide_buy(fill: &FillEvent, ctx: &RiskContext<'_>, cfg: &RiskConfig) -> Decision {
    let snapshot = match ctx.snapshot {
        Some(s)
            if s.total_value >= cfg.per_trader.min_portfolio_value
                && s.total_value > Decimal::ZERO =>
        {
            s
        }
        _ => {
            return Decision::Reject {
                reason: "portfolio too small or unknown".into(),
            }
        }
    };

    if fill.price <= Decimal::ZERO || fill.size <= Decimal::ZERO {
        return Decision::Reject {
            reason: "fill has no usable price or size".into(),
        };
    }

    // Conviction is a dollar concept: proportion by notional, not share count.
    let position_pct = if cfg.per_trader.use_portfolio_proportion {
        fill.notional() / snapshot.total_value
    } else {
        Decimal::ONE
    };

    let deployment_rate = snapshot.deployment_rate;
    let effective_allocation = (fill.allocated_capital * deployment_rate)
        .max(Decimal::ZERO)
        .min(fill.allocated_capital);

    let raw_mirror = effective_allocation * position_pct;
    let mut mirror_usd = raw_mirror
        .min(cfg.global.max_single_bet)
        .min(cfg.per_trader.max_position_pct * fill.allocated_capital);

    let mut note = format!(
        "{:.2}% of trader portfolio; deployment {:.1}%",
        position_pct * Decimal::ONE_HUNDRED,
        deployment_rate * Decimal::ONE_HUNDRED,
    );

    // Venue rejects sub-dollar orders; floor when the allocation covers it.
    if mirror_usd > Decimal::ZERO && mirror_usd < MIN_ORDER_USD {
        if effective_allocation < MIN_ORDER_USD {
            return Decision::Reject {
                reason: "allocation below minimum order".into(),
            };
        }
        mirror_usd = MIN_ORDER_USD;
        note.push_str(" (floored to $1 min)");
    }

    if mirror_usd <= Decimal::ZERO {
        return Decision::Reject {
            reason: "mirror size is zero".into(),
        };
    }

    let shares = mirror_usd / fill.price;
    let min_order_size = ctx.market.map(|m| m.min_order_size).unwrap_or(Decimal::ZERO);
    if min_order_size > Decimal::ZERO && shares < min_order_size {
        return Decision::Reject {
            reason: "below min order size".into(),
        };
    }

    // Gate 1: category filters.
    let category = ctx.market.and_then(|m| m.category.as_deref());
    let filters = &cfg.market_filters;
    if let Some(cat) = category {
        if filters
            .blacklist_categories
            .iter()
            .any(|c| c.eq_ignore_ascii_case(cat))
        {
            return Decision::Reject {
                reason: format!("category '{cat}' is blacklisted"),
            };
        }
    }
    if !filters.whitelist_categories.is_empty() {
        let allowed = category
            .map(|cat| {
                filters
                    .whitelist_categories
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(cat))
            })
            .unwrap_or(false);
        if !allowed {
            return Decision::Reject {
                reason: "category not in whitelist".into(),
            };
        }
    }

    // Gate 2: liquidity.
    if filters.min_liquidity > Decimal::ZERO {
        let liquidity = ctx.market.map(|m| m.liquidity).unwrap_or(Decimal::ZERO);
        if liquidity < filters.min_liquidity {
            return Decision::Reject {
                reason: format!("market liquidity {liquidity} below minimum"),
            };
        }
    }

    // Gate 3: per-leader exposure cap.
    let leader_exposure = ctx.ledger.exposure_of(&fill.leader_wallet);
    if mirror_usd + leader_exposure > fill.allocated_capital {
        return Decision::Reject {
            reason: "exceeds allocated capital for trader".into(),
        };
    }

    // Gate 4: global exposure cap.
    if mirror_usd + ctx.ledger.global > cfg.global.max_total_exposure {
        return Decision::Reject {
            reason: "exceeds global exposure limit".into(),
        };
    }

    Decision::Buy {
        mirror_usd,
        shares,
        note,
    }
}

/// A leader SELL is a signal to reduce or exit the mirror position. The
/// reduction fraction is the fraction the leader sold of their own holding,
/// derived from consecutive portfolio snapshots.
fn decide_sell(fill: &FillEvent, ctx: &RiskContext<'_>) -> Decision {
    if ctx.mirror_position.is_none() {
        return Decision::Skip {
            reason: "no mirror position to reduce".into(),
        };
    }

    let snapshot = match ctx.snapshot {
        Some(s) => s,
        None if ctx.allow_stale_sell => {
            // Portfolio sync is broken; nothing to derive from. Keep the
            // position rather than guessing an exit.
            return Decision::Skip {
                reason: "portfolio unknown; cannot derive sell fraction".into(),
            };
        }
        None => {
            return Decision::Defer {
                reason: "no portfolio snapshot for sell derivation".into(),
            }
        }
    };

    let snapshot_ts = snapshot.fetched_at.timestamp();
    if snapshot_ts < fill.timestamp {
        if !ctx.allow_stale_sell {
            return Decision::Defer {
                reason: "awaiting post-fill portfolio sync".into(),
            };
        }
        // Stale fallback: the snapshot predates the sell, so it records the
        // leader's pre-sell holding.
        let pre = snapshot.token_size(&fill.token_id);
        if pre <= Decimal::ZERO {
            return Decision::Reduce {
                fraction: Decimal::ONE,
                note: "leader position unknown; full exit".into(),
            };
        }
        let fraction = (fill.size / pre).min(Decimal::ONE);
        return Decision::Reduce {
            fraction,
            note: format!(
                "sold {:.1}% of position (fill-derived)",
                fraction * Decimal::ONE_HUNDRED
            ),
        };
    }

    let post = snapshot.token_size(&fill.token_id);
    if post <= Decimal::ZERO {
        // Leader's position dropped to zero: full exit.
        return Decision::Reduce {
            fraction: Decimal::ONE,
            note: "leader exited position".into(),
        };
    }

    let pre = ctx
        .previous_snapshot
        .map(|s| s.token_size(&fill.token_id))
        .filter(|s| *s > Decimal::ZERO)
        .unwrap_or(post + fill.size);

    if pre <= post {
        return Decision::Skip {
            reason: "leader position did not shrink".into(),
        };
    }

    let fraction = ((pre - post) / pre).min(Decimal::ONE);
    Decision::Reduce {
        fraction,
        note: format!("sold {:.1}% of position", fraction * Decimal::ONE_HUNDRED),
    }
}
