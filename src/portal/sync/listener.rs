//! 同步监听器回调接口

use async_trait::async_trait;

/// 列表同步回调，记录以 JSON 字符串传出
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// 开始首次拉取
    async fn on_sync_start(&self, collection: &str);

    /// 首次拉取完成，`total` 为列表条数
    async fn on_sync_finish(&self, collection: &str, total: usize);

    /// 首次拉取或订阅失败，列表为空
    async fn on_sync_failed(&self, collection: &str, reason: String);

    /// 新记录插入到 `index` 位置
    async fn on_record_inserted(&self, collection: &str, index: usize, record_json: String);

    /// `index` 位置的记录被原地更新（包括补全作者资料）
    async fn on_record_updated(&self, collection: &str, index: usize, record_json: String);

    async fn on_record_deleted(&self, collection: &str, id: String);

    /// 推送订阅断开，列表不再实时更新，需要重新 initialize
    async fn on_subscription_lost(&self, collection: &str);
}

/// 默认空实现（无操作）
pub struct EmptySyncListener;

#[async_trait]
impl SyncListener for EmptySyncListener {
    async fn on_sync_start(&self, _collection: &str) {}

    async fn on_sync_finish(&self, _collection: &str, _total: usize) {}

    async fn on_sync_failed(&self, _collection: &str, _reason: String) {}

    async fn on_record_inserted(&self, _collection: &str, _index: usize, _record_json: String) {}

    async fn on_record_updated(&self, _collection: &str, _index: usize, _record_json: String) {}

    async fn on_record_deleted(&self, _collection: &str, _id: String) {}

    async fn on_subscription_lost(&self, _collection: &str) {
        // 默认不做任何处理
    }
}
