use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use voxsight::bot::buttons::{self, AdviceContext, CallbackData, ContextStore};
use voxsight::bot::{ChatNotifier, TelegramClient};
use voxsight::config::Config;
use voxsight::instance::InstanceGuard;
use voxsight::pipeline::archetype::Archetype;
use voxsight::pipeline::completion::{CompletionBackend, CompletionClient};
use voxsight::pipeline::format::html_escape;
use voxsight::pipeline::lang_cache::LanguageCache;
use voxsight::pipeline::modes::ModeStore;
use voxsight::pipeline::stt::TranscriptionClient;
use voxsight::pipeline::{AnalysisStage, Pipeline, TranscriptionStage};

const GENERIC_FAILURE: &str = "⚠️ Обработка не удалась. Пожалуйста, попробуй позже.";
const SESSION_EXPIRED: &str = "⏳ Сессия истекла. Отправь сообщение ещё раз.";

struct BotState {
    config: Config,
    telegram: Arc<TelegramClient>,
    pipeline: Pipeline,
    modes: Arc<ModeStore>,
    contexts: ContextStore,
}

impl BotState {
    fn new(config: Config, bot: &Bot) -> Self {
        let telegram = Arc::new(TelegramClient::new(bot.clone()));

        let modes = Arc::new(match ModeStore::load(config.modes_dir.clone()) {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to load modes: {e}");
                ModeStore::new(config.modes_dir.clone())
            }
        });

        let cache = Arc::new(LanguageCache::open(
            &config.data_dir.join("lang_prefs.db"),
            config.language_cache_ttl_days,
            config.language_confidence_threshold,
        ));

        let stt = Arc::new(TranscriptionClient::new(
            config.api_base_url.clone(),
            config.openai_api_key.clone(),
            config.transcription_model.clone(),
        ));
        let completions: Arc<dyn CompletionBackend> = Arc::new(CompletionClient::new(
            config.api_base_url.clone(),
            config.openai_api_key.clone(),
        ));

        let transcription =
            TranscriptionStage::new(stt, cache, config.priority_languages.clone());
        let analysis = AnalysisStage::new(
            completions.clone(),
            modes.clone(),
            Duration::from_secs(config.analysis_deadline_secs),
        );
        let pipeline = Pipeline::new(transcription, analysis, completions, modes.clone());

        Self {
            config,
            telegram,
            pipeline,
            modes,
            contexts: ContextStore::new(Duration::from_secs(3600)),
        }
    }
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "voxsight.json".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    // Setup logging
    let log_dir = config.data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join("voxsight.log"))
        .expect("Failed to open log file");
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::INFO.into()),
                ),
        )
        .init();

    info!("🚀 Starting voxsight...");
    info!("Loaded config from {config_path}");

    // Two instances would fight over the same long-poll queue; enforce the
    // invariant before any network traffic. Acquisition failure aborts startup.
    let guard = InstanceGuard::new("voxsight");
    let mut lock = match guard.acquire(&config.lock_file) {
        Ok(lock) => lock,
        Err(e) => {
            error!("FATAL: single-instance enforcement failed: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);
    let state = Arc::new(BotState::new(config, &bot));

    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    lock.release();
}

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let user_id = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(0);

    if let Some(voice) = msg.voice() {
        let file_id = voice.file.id.0.clone();
        let duration = voice.duration.seconds();
        info!("🎙️ Voice message from user {user_id}, duration: {duration}s");
        handle_audio(&state, &msg, file_id, duration, user_id, "🎙️ Обрабатываю голосовое сообщение...")
            .await;
        return Ok(());
    }

    if let Some(note) = msg.video_note() {
        let file_id = note.file.id.0.clone();
        let duration = note.duration.seconds();
        info!("🎥 Video note from user {user_id}, duration: {duration}s");
        handle_audio(&state, &msg, file_id, duration, user_id, "🎥 Обрабатываю видео сообщение...")
            .await;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        return Ok(());
    };

    if let Some(command) = text.strip_prefix('/') {
        handle_command(&state, &msg, command).await;
        return Ok(());
    }

    handle_text(&state, &msg, text).await;
    Ok(())
}

async fn handle_audio(
    state: &BotState,
    msg: &Message,
    file_id: String,
    duration: u32,
    user_id: i64,
    notice: &str,
) {
    let chat_id = msg.chat.id.0;

    if duration > state.config.max_voice_duration_secs {
        let limit_min = state.config.max_voice_duration_secs / 60;
        state
            .telegram
            .send_message(
                chat_id,
                &format!("⚠️ Сообщение длиннее {limit_min} минут — не возьмусь."),
                Some(msg.id.0 as i64),
                None,
            )
            .await
            .ok();
        return;
    }

    let Ok(processing_id) =
        state.telegram.send_message(chat_id, notice, Some(msg.id.0 as i64), None).await
    else {
        return;
    };

    let audio = match state.telegram.download_file(&file_id).await {
        Ok(audio) => audio,
        Err(e) => {
            warn!("Failed to download audio: {e}");
            state.telegram.edit_message(chat_id, processing_id, GENERIC_FAILURE, None).await.ok();
            return;
        }
    };

    let notifier = ChatNotifier::new(state.telegram.clone(), chat_id);
    match state.pipeline.process_voice(audio, user_id, &notifier).await {
        Ok(outcome) => {
            let scores = outcome.analysis.emotion_scores().unwrap_or_default();
            state.contexts.insert(
                chat_id,
                processing_id,
                AdviceContext { transcript: outcome.transcript.clone(), scores },
            );
            state
                .telegram
                .edit_message(
                    chat_id,
                    processing_id,
                    &outcome.reply_text,
                    Some(buttons::initial_keyboard(true)),
                )
                .await
                .ok();
        }
        Err(failure) => {
            if failure.user_notified {
                // The retry client already delivered the failure notice;
                // a second message would be noise.
                state.telegram.delete_message(chat_id, processing_id).await.ok();
            } else {
                state
                    .telegram
                    .edit_message(chat_id, processing_id, GENERIC_FAILURE, None)
                    .await
                    .ok();
            }
        }
    }
}

async fn handle_text(state: &BotState, msg: &Message, text: &str) {
    let chat_id = msg.chat.id.0;
    let text = text.trim();

    if text.chars().count() < 5 {
        state
            .telegram
            .send_message(
                chat_id,
                "📝 Слишком короткий текст для анализа. Минимум 5 символов.",
                Some(msg.id.0 as i64),
                None,
            )
            .await
            .ok();
        return;
    }

    let Ok(processing_id) = state
        .telegram
        .send_message(chat_id, "📝 Анализируем текст...", Some(msg.id.0 as i64), None)
        .await
    else {
        return;
    };

    let outcome = state.pipeline.process_text(text).await;
    let scores = outcome.analysis.emotion_scores().unwrap_or_default();
    state.contexts.insert(
        chat_id,
        processing_id,
        AdviceContext { transcript: outcome.transcript.clone(), scores },
    );
    state
        .telegram
        .edit_message(
            chat_id,
            processing_id,
            &outcome.reply_text,
            Some(buttons::initial_keyboard(false)),
        )
        .await
        .ok();
}

async fn handle_command(state: &BotState, msg: &Message, command: &str) {
    let chat_id = msg.chat.id.0;
    let name = command.split_whitespace().next().unwrap_or("");
    let name = name.split('@').next().unwrap_or("");

    match name {
        "start" => {
            let text = "🎙️ <b>Голосовые сообщения → инсайты</b>\n\n\
                Перешли мне голосовое или видео сообщение — я распознаю речь \
                и разберу содержание по настроенным режимам анализа.\n\n\
                <b>Команды:</b>\n\
                /help — справка\n\
                /health — статус системы\n\
                /stats — статистика обработки";
            state.telegram.send_message(chat_id, text, None, None).await.ok();
        }
        "help" => {
            let text = "📖 <b>Как пользоваться</b>\n\n\
                • Перешли голосовое сообщение, видео-кружок или текст\n\
                • Получишь резюме, основные пункты и действия\n\
                • Кнопка «🤖 совет» подберёт стиль ответа по эмоциям\n\
                • Кнопка «📄 транскрипт» пришлёт полный текст файлом\n\n\
                Максимальная длительность аудио: 10 минут";
            state.telegram.send_message(chat_id, text, None, None).await.ok();
        }
        "health" => {
            let total = state.modes.len();
            let enabled = state.modes.enabled().len();
            let text = format!(
                "✅ <b>Система работает</b>\n\n\
                 • Режимы: {enabled} активно из {total}\n\
                 • Транскрипция: {}\n\
                 • Модель: {}",
                state.config.api_base_url, state.config.transcription_model
            );
            state.telegram.send_message(chat_id, &text, None, None).await.ok();
        }
        "stats" => {
            let text = state.pipeline.stats().summary_ru();
            state.telegram.send_message(chat_id, &text, None, None).await.ok();
        }
        "reload_modes" => {
            let Some(user) = msg.from.as_ref() else { return };
            if !state.config.is_owner(user.id) {
                return;
            }
            let text = match state.modes.reload() {
                Ok(count) => format!("🔄 Режимы перезагружены: {count}"),
                Err(e) => {
                    error!("Mode reload rejected: {e}");
                    format!("❌ Перезагрузка отклонена: {}", html_escape(&e.to_string()))
                }
            };
            state.telegram.send_message(chat_id, &text, None, None).await.ok();
        }
        _ => {}
    }
}

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(data) = q.data.as_deref().and_then(CallbackData::parse) else {
        bot.answer_callback_query(q.id.clone()).await.ok();
        return Ok(());
    };
    let Some((chat_id, message_id)) =
        q.message.as_ref().map(|m| (m.chat().id.0, m.id().0 as i64))
    else {
        bot.answer_callback_query(q.id.clone()).await.ok();
        return Ok(());
    };

    let context = state.contexts.get(chat_id, message_id);

    match data {
        CallbackData::AdviceSuggest => match context {
            Some(ctx) => {
                let suggested = Archetype::select(&ctx.scores);
                state
                    .telegram
                    .edit_keyboard(chat_id, message_id, buttons::suggestion_keyboard(suggested))
                    .await
                    .ok();
                bot.answer_callback_query(q.id.clone())
                    .text(format!(
                        "{}\n\nРекомендую: {} {} — {}",
                        ctx.scores.describe_ru(),
                        suggested.emoji(),
                        suggested.as_str(),
                        suggested.description_ru()
                    ))
                    .show_alert(true)
                    .await
                    .ok();
            }
            None => {
                bot.answer_callback_query(q.id.clone())
                    .text(SESSION_EXPIRED)
                    .show_alert(true)
                    .await
                    .ok();
            }
        },
        CallbackData::ManualMenu => {
            state.telegram.edit_keyboard(chat_id, message_id, buttons::manual_keyboard()).await.ok();
            bot.answer_callback_query(q.id.clone()).await.ok();
        }
        CallbackData::BackToSuggestion => {
            // The selector output is a suggestion; recompute from the stored
            // scores, falling back to the default persona without them.
            let suggested =
                context.map(|c| Archetype::select(&c.scores)).unwrap_or(Archetype::Paradox);
            state
                .telegram
                .edit_keyboard(chat_id, message_id, buttons::suggestion_keyboard(suggested))
                .await
                .ok();
            bot.answer_callback_query(q.id.clone()).await.ok();
        }
        CallbackData::AdviceAuto(archetype) | CallbackData::AdviceManual(archetype) => {
            let Some(ctx) = context else {
                bot.answer_callback_query(q.id.clone())
                    .text(SESSION_EXPIRED)
                    .show_alert(true)
                    .await
                    .ok();
                return Ok(());
            };
            bot.answer_callback_query(q.id.clone()).await.ok();

            let notifier = ChatNotifier::new(state.telegram.clone(), chat_id);
            match state.pipeline.advice(&ctx.transcript, archetype, &notifier).await {
                Ok(advice) => {
                    let text = format!(
                        "{} <b>{}</b>\n\n{}",
                        archetype.emoji(),
                        archetype.as_str(),
                        html_escape(&advice)
                    );
                    state
                        .telegram
                        .send_message(
                            chat_id,
                            &text,
                            Some(message_id),
                            Some(buttons::response_keyboard()),
                        )
                        .await
                        .ok();
                }
                // The retry client already notified the user.
                Err(_) => {}
            }
        }
        CallbackData::TranscriptDownload => {
            let Some(ctx) = context else {
                bot.answer_callback_query(q.id.clone())
                    .text(SESSION_EXPIRED)
                    .show_alert(true)
                    .await
                    .ok();
                return Ok(());
            };
            bot.answer_callback_query(q.id.clone()).await.ok();
            state
                .telegram
                .send_document(chat_id, ctx.transcript.into_bytes(), "transcript.txt")
                .await
                .ok();
        }
    }

    Ok(())
}
