//! 村务门户 CLI
//!
//! 非交互式 CLI，用于测试和展示实时列表同步：
//! 登录（或使用本地数据库）后执行一个子命令，`watch` 会持续输出收到的变更。

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use village_portal_sdk_rust::portal::client::{ENV_ANON_KEY, ENV_URL};
use village_portal_sdk_rust::{
    ClientConfig, ContactDirectory, ContactDraft, MediaUpload, PortalClient, SyncListener,
};

/// 村务门户 CLI
#[derive(Parser, Debug)]
#[command(name = "portal-cli")]
#[command(about = "村务门户 CLI - 用于测试和展示实时同步", long_about = None)]
struct Args {
    /// 后端项目地址
    #[arg(long, env = ENV_URL)]
    url: Option<String>,

    /// 匿名 key
    #[arg(long, env = ENV_ANON_KEY)]
    anon_key: Option<String>,

    /// 登录邮箱
    #[arg(short, long, env = "VILLAGE_PORTAL_EMAIL")]
    email: Option<String>,

    /// 登录密码
    #[arg(short, long, env = "VILLAGE_PORTAL_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// 使用本地 SQLite 数据库，例如 sqlite://portal.db?mode=rwc
    #[arg(long)]
    local: Option<String>,

    /// 本地模式下的用户 ID
    #[arg(long, default_value = "local-user")]
    user_id: String,

    /// 请求超时（秒）
    #[arg(long, default_value = "15")]
    timeout: u64,

    /// 日志级别（默认: info,village_portal_sdk_rust=debug）
    #[arg(long, default_value = "info,village_portal_sdk_rust=debug")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 同步并持续监听一个列表
    Watch {
        #[arg(value_enum)]
        feed: Feed,
        /// 运行时长（秒），0 表示直到 Ctrl+C
        #[arg(short, long, default_value = "0")]
        duration: u64,
    },
    /// 在聊天室发送消息
    Say {
        text: String,
        /// 附件（图片/视频/语音）
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// 发布新闻
    Post {
        title: String,
        content: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// 上传照片到照片墙
    Upload {
        image: PathBuf,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// 列出紧急联系人（管理员同时列出待审核）
    Contacts,
    /// 提交紧急联系人
    SubmitContact {
        name: String,
        role: String,
        phone: String,
    },
    /// 查看资料；提供 --name 时更新名字
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Feed {
    Chat,
    Gallery,
    News,
    Contacts,
}

/// 初始化日志（同时输出到 stdout 和文件）
fn init_logger(log_level: &str) -> Result<()> {
    use std::fs::OpenOptions;
    use std::io;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    // 优先使用环境变量 RUST_LOG
    let filter_layer =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("portal-cli.log")
        .context("无法创建日志文件 portal-cli.log")?;

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stdout)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(true);

    // 文件不需要颜色
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_file(true)
        .with_line_number(true)
        .with_target(false)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    info!("[CLI] 📝 日志已同时输出到控制台和文件: portal-cli.log");
    Ok(())
}

/// 输出所有同步回调
struct CliListener;

#[async_trait::async_trait]
impl SyncListener for CliListener {
    async fn on_sync_start(&self, collection: &str) {
        info!("[CLI/{}] 🔄 同步开始", collection);
    }

    async fn on_sync_finish(&self, collection: &str, total: usize) {
        info!("[CLI/{}] ✅ 同步完成，共 {} 条", collection, total);
    }

    async fn on_sync_failed(&self, collection: &str, reason: String) {
        error!("[CLI/{}] ❌ 同步失败: {}", collection, reason);
    }

    async fn on_record_inserted(&self, collection: &str, index: usize, record_json: String) {
        info!("[CLI/{}] 🆕 #{}: {}", collection, index, record_json);
    }

    async fn on_record_updated(&self, collection: &str, index: usize, record_json: String) {
        info!("[CLI/{}] ✏️ #{}: {}", collection, index, record_json);
    }

    async fn on_record_deleted(&self, collection: &str, id: String) {
        info!("[CLI/{}] 🗑️ {}", collection, id);
    }

    async fn on_subscription_lost(&self, collection: &str) {
        warn!("[CLI/{}] 🔌 推送已断开，需要重新同步", collection);
    }
}

async fn build_client(args: &Args) -> Result<PortalClient> {
    if let Some(db_url) = &args.local {
        return PortalClient::local(db_url, &args.user_id).await;
    }

    let (Some(url), Some(anon_key)) = (&args.url, &args.anon_key) else {
        bail!(
            "请通过 --url/--anon-key 或环境变量 {}/{} 指定后端，或使用 --local",
            ENV_URL,
            ENV_ANON_KEY
        );
    };
    let config = ClientConfig::new(url.clone(), anon_key.clone())
        .with_request_timeout(Duration::from_secs(args.timeout));
    let client = PortalClient::connect(config).await?;

    if let (Some(email), Some(password)) = (&args.email, &args.password) {
        let session = client.sign_in(email, password).await?;
        info!("[CLI] ✅ 登录成功！用户ID: {}", session.user.id);
    } else {
        info!("[CLI] 👀 未登录，以访客身份浏览");
    }
    Ok(client)
}

async fn wait(duration: u64) {
    if duration > 0 {
        info!("[CLI] ⏰ {} 秒后自动退出", duration);
        sleep(Duration::from_secs(duration)).await;
    } else {
        info!("[CLI] ⏰ 持续运行中，按 Ctrl+C 退出");
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn watch(client: &PortalClient, feed: Feed, duration: u64) -> Result<()> {
    let listener: Arc<dyn SyncListener> = Arc::new(CliListener);
    match feed {
        Feed::Chat => {
            let room = client.chat_room(listener);
            room.open().await?;
            for m in room.messages() {
                info!(
                    "[CLI]   {} | {}: {}",
                    m.created_at,
                    m.author_name(),
                    m.payload.message
                );
            }
            wait(duration).await;
            room.close().await;
        }
        Feed::Gallery => {
            let gallery = client.gallery(listener);
            gallery.open().await?;
            for item in gallery.items() {
                info!(
                    "[CLI]   {} | {} | {}",
                    item.author_name(),
                    item.payload.title,
                    item.payload.image_url
                );
            }
            wait(duration).await;
            gallery.close().await;
        }
        Feed::News => {
            let board = client.news_board(listener);
            board.open().await?;
            for item in board.items() {
                info!(
                    "[CLI]   {} | {} | {}",
                    item.created_at,
                    item.payload.title,
                    item.author_name()
                );
            }
            wait(duration).await;
            board.close().await;
        }
        Feed::Contacts => {
            let directory = client.contact_directory(listener).await?;
            print_contacts(&directory);
            wait(duration).await;
            directory.close().await;
        }
    }
    Ok(())
}

fn print_contacts(directory: &ContactDirectory) {
    let approved = directory.approved();
    info!("[CLI] 📇 紧急联系人（共 {} 个）:", approved.len());
    for c in &approved {
        info!(
            "[CLI]   - {} | {} | {}",
            c.payload.name, c.payload.role, c.payload.phone
        );
    }
    if directory.is_admin() {
        let pending = directory.pending();
        info!("[CLI] 📝 待审核（共 {} 个）:", pending.len());
        for c in &pending {
            info!(
                "[CLI]   - [{}] {} | {} | {}",
                c.id, c.payload.name, c.payload.role, c.payload.phone
            );
        }
    }
}

async fn load_media(path: &Option<PathBuf>) -> Result<Option<MediaUpload>> {
    match path {
        Some(path) => Ok(Some(MediaUpload::from_path(path).await?)),
        None => Ok(None),
    }
}

async fn run(args: Args) -> Result<()> {
    let client = build_client(&args).await?;
    let listener: Arc<dyn SyncListener> = Arc::new(CliListener);

    match args.command {
        Command::Watch { feed, duration } => watch(&client, feed, duration).await?,
        Command::Say { text, file } => {
            let media = load_media(&file).await?;
            let room = client.chat_room(listener);
            let sent = room.send_message(&text, media).await?;
            info!("[CLI] 💬 已发送 {}", sent.id);
        }
        Command::Post {
            title,
            content,
            image,
        } => {
            let image = load_media(&image).await?;
            let board = client.news_board(listener);
            let posted = board.post_news(&title, &content, image).await?;
            info!("[CLI] 📰 已发布 {}", posted.id);
        }
        Command::Upload {
            image,
            title,
            description,
        } => {
            let image = MediaUpload::from_path(&image).await?;
            let gallery = client.gallery(listener);
            let item = gallery.upload_photo(&title, &description, image).await?;
            info!("[CLI] 🖼️ 已上传 {} → {}", item.id, item.payload.image_url);
        }
        Command::Contacts => {
            let directory = client.contact_directory(listener).await?;
            print_contacts(&directory);
            directory.close().await;
        }
        Command::SubmitContact { name, role, phone } => {
            let directory = client.contact_directory(listener).await?;
            let submitted = directory
                .submit_contact(ContactDraft::new(&name, &role, &phone), None)
                .await?;
            info!("[CLI] 📇 已提交 {}，等待管理员审核", submitted.id);
            directory.close().await;
        }
        Command::Profile { name, avatar } => {
            let profiles = client.profiles();
            if let Some(name) = name {
                let avatar = load_media(&avatar).await?;
                profiles.update_profile(&name, avatar).await?;
            }
            match profiles.current_profile().await? {
                Some(p) => info!(
                    "[CLI] 👤 {} | {} | 管理员: {} | 头像: {}",
                    p.id,
                    p.full_name.as_deref().unwrap_or("（未填写）"),
                    p.is_admin,
                    p.avatar_url.as_deref().unwrap_or("-")
                ),
                None => warn!("[CLI] 当前用户没有资料"),
            }
            if profiles.needs_onboarding().await? {
                info!("[CLI] 💡 提示：使用 profile --name <名字> 完成新用户引导");
            }
        }
    }

    client.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(&args.log_level)?;
    info!("[CLI] 🚀 村务门户 CLI");

    if let Err(e) = run(args).await {
        error!("[CLI] ❌ {:#}", e);
        return Err(e);
    }
    info!("[CLI] 👋 程序退出");
    Ok(())
}
