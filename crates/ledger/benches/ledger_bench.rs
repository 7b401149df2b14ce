use chrono::{Duration, Utc};
use criterion::{Criterion, criterion_group, criterion_main};
use ledger::{
    CheckoutRef, HolderId, InMemoryStockLedger, ItemId, Money, Reservation, StockLedger,
};

fn make_hold(item: &ItemId, checkout_ref: CheckoutRef) -> Reservation {
    let now = Utc::now();
    Reservation {
        checkout_ref,
        holder_id: HolderId::guest(),
        item_id: item.clone(),
        quantity: 1,
        unit_price: Money::from_cents(1000),
        created_at: now,
        expires_at: now + Duration::minutes(10),
    }
}

fn bench_reserve_release(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ledger = InMemoryStockLedger::new();
    let item = ItemId::new("SKU-BENCH");
    rt.block_on(ledger.list_item(&item, 1_000)).unwrap();

    c.bench_function("ledger/reserve_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let checkout_ref = CheckoutRef::new();
                ledger
                    .try_reserve(&make_hold(&item, checkout_ref))
                    .await
                    .unwrap();
                ledger.release_reserved(&item, checkout_ref).await.unwrap();
            });
        });
    });
}

fn bench_reserve_confirm(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ledger/reserve_confirm", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ledger = InMemoryStockLedger::new();
                let item = ItemId::new("SKU-BENCH");
                ledger.list_item(&item, 10).await.unwrap();
                let checkout_ref = CheckoutRef::new();
                ledger
                    .try_reserve(&make_hold(&item, checkout_ref))
                    .await
                    .unwrap();
                ledger.confirm_reserved(&item, checkout_ref).await.unwrap();
            });
        });
    });
}

fn bench_contended_last_units(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("ledger/contended_100_tasks_10_units", |b| {
        b.iter(|| {
            rt.block_on(async {
                let ledger = InMemoryStockLedger::new();
                let item = ItemId::new("SKU-HOT");
                ledger.list_item(&item, 10).await.unwrap();

                let handles: Vec<_> = (0..100)
                    .map(|_| {
                        let ledger = ledger.clone();
                        let item = item.clone();
                        tokio::spawn(async move {
                            ledger
                                .try_reserve(&make_hold(&item, CheckoutRef::new()))
                                .await
                                .unwrap()
                        })
                    })
                    .collect();
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    });
}

criterion_group!(
    benches,
    bench_reserve_release,
    bench_reserve_confirm,
    bench_contended_last_units
);
criterion_main!(benches);
