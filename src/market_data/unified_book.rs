use crate::engine::book::OwnLevels;
use crate::engine::types::{PriceLevel, Side};
use crate::market_data::external_book::ExternalBook;

/// How own size is folded into the venue ladder.
#[derive(Debug, Clone, Copy)]
pub struct MergeOptions<'a> {
    /// Show own size as separate rows tagged with `venue_marker` instead of
    /// annotating the matching venue level.
    pub multi_venue: bool,
    pub venue_marker: &'a str,
}

/// Combined view: the venue ladder with the trader's own resting size merged in.
///
/// Both inputs are sorted, so this is a single pass over each side.
pub fn merge(book: &ExternalBook, own_bids: &OwnLevels, own_asks: &OwnLevels, opts: MergeOptions<'_>) -> ExternalBook {
    ExternalBook {
        bids: merge_side(
            &book.bids,
            own_bids.iter().rev().map(|(p, v)| (p.0, *v)),
            Side::Buy,
            opts,
        ),
        asks: merge_side(
            &book.asks,
            own_asks.iter().map(|(p, v)| (p.0, *v)),
            Side::Sell,
            opts,
        ),
    }
}

/// Merge own `(price, volume)` aggregates, given in the side's order, into
/// that side's levels.
pub fn merge_side<I>(levels: &[PriceLevel], own: I, side: Side, opts: MergeOptions<'_>) -> Vec<PriceLevel>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let own = own.into_iter();
    let mut out = Vec::with_capacity(levels.len() + own.size_hint().0);
    let mut book = levels.iter().cloned().peekable();

    for (price, own_volume) in own {
        // Everything strictly ahead of the own price goes out unchanged
        while let Some(level) = book.next_if(|l| side.is_better(l.price, price)) {
            out.push(level);
        }

        match book.peek_mut() {
            Some(level) if level.price == price && !opts.multi_venue => {
                level.own_volume = Some(own_volume);
                // Feed size is taken to include our resting size unless ours is larger
                if level.volume < own_volume {
                    level.volume += own_volume;
                }
            }
            // Equal price in multi-venue mode, a worse level, or end of side
            _ => out.push(own_level(price, own_volume, opts)),
        }
    }

    out.extend(book);
    out
}

fn own_level(price: f64, volume: f64, opts: MergeOptions<'_>) -> PriceLevel {
    PriceLevel {
        price,
        volume,
        own_volume: Some(volume),
        venue: opts.multi_venue.then(|| opts.venue_marker.to_string()),
    }
}
